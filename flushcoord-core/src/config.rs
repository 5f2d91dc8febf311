//! Coordinator configuration
//!
//! Groups the per-manager configs. Loadable from JSON or from
//! `FLUSHCOORD_*` environment variables on top of the defaults.

use serde::Deserialize;
use std::str::FromStr;

use crate::election::ElectionConfig;
use crate::error::{CoordError, Result};
use crate::flush::FlushTimesConfig;
use crate::placement::PlacementConfig;

const ENV_PREFIX: &str = "FLUSHCOORD_";

/// Configuration for all coordination managers of one instance
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub placement: PlacementConfig,
    pub election: ElectionConfig,
    pub flush_times: FlushTimesConfig,
}

impl CoordinatorConfig {
    /// Parse from JSON; omitted fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoordError::Config {
            reason: e.to_string(),
        })
    }

    /// Defaults overridden by `FLUSHCOORD_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by variables resolved through `lookup`
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(id) = var("INSTANCE_ID") {
            config = config.with_instance_id(id);
        }
        if let Some(key) = var("PLACEMENT_KEY") {
            config.placement.placement_key = key;
        }
        if let Some(prefix) = var("KEY_PREFIX") {
            config.election.key_prefix = prefix.clone();
            config.flush_times.key_prefix = prefix;
        }
        if let Some(v) = var("LEASE_TTL_MS") {
            config.election.lease_ttl_ms = parse("LEASE_TTL_MS", &v)?;
        }
        if let Some(v) = var("RENEW_INTERVAL_MS") {
            config.election.renew_interval_ms = parse("RENEW_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("RESIGN_COOLDOWN_MS") {
            config.election.resign_cooldown_ms = parse("RESIGN_COOLDOWN_MS", &v)?;
        }
        if let Some(v) = var("CLOSE_TIMEOUT_MS") {
            config.flush_times.close_timeout_ms = parse("CLOSE_TIMEOUT_MS", &v)?;
        }
        Ok(config)
    }

    /// Use `id` as the placement instance and as the flush times writer
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.flush_times.writer_id = id.clone();
        self.placement.instance_id = id;
        self
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| CoordError::Config {
        reason: format!("{}{}={:?}: {}", ENV_PREFIX, name, value, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_json_partial() {
        let config = CoordinatorConfig::from_json(
            r#"{
                "placement": {"instance_id": "agg-1:6000"},
                "election": {"lease_ttl_ms": 3000, "backoff": {"initial_ms": 10}},
                "flush_times": {"writer_id": "agg-1:6000"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.placement.instance_id, "agg-1:6000");
        assert_eq!(config.placement.placement_key, "/placement/aggregator");
        assert_eq!(config.election.lease_ttl_ms, 3000);
        assert_eq!(config.election.backoff.initial_ms, 10);
        assert_eq!(config.election.backoff.max_ms, 5000);
        assert_eq!(config.flush_times.writer_id, "agg-1:6000");
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            CoordinatorConfig::from_json("{not json"),
            Err(CoordError::Config { .. })
        ));
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("FLUSHCOORD_INSTANCE_ID", "agg-2:6000"),
            ("FLUSHCOORD_KEY_PREFIX", "/m3agg"),
            ("FLUSHCOORD_LEASE_TTL_MS", "1500"),
        ]
        .into_iter()
        .collect();
        let config = CoordinatorConfig::from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.placement.instance_id, "agg-2:6000");
        assert_eq!(config.flush_times.writer_id, "agg-2:6000");
        assert_eq!(config.election.election_key(4), "/m3agg/4/lock");
        assert_eq!(config.flush_times.flush_times_key(4), "/m3agg/4/flush");
        assert_eq!(config.election.lease_ttl_ms, 1500);
    }

    #[test]
    fn test_from_vars_bad_number() {
        let err = CoordinatorConfig::from_vars(|k| {
            (k == "FLUSHCOORD_CLOSE_TIMEOUT_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, CoordError::Config { .. }));
    }
}
