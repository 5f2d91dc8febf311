//! Exponential backoff with jitter for background retry loops

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for retry backoff
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_ms: u64,
    /// Upper bound on any single delay
    pub max_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Fraction of each delay that is randomized (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 50,
            max_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Stateful backoff sequence for one retry loop
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay in the sequence
    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.initial_ms as f64 * self.config.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.max_ms as f64);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let spread = capped * jitter;
        let delay = if spread > 0.0 {
            let offset = rand::rng().random_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(delay.min(self.config.max_ms as f64) as u64)
    }

    /// Sleep for the next delay in the sequence
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_ms: 10,
            max_ms: 100,
            multiplier: 2.0,
            jitter: 0.0,
        });

        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100, 100]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 1.0,
            jitter: 0.5,
        });

        for _ in 0..100 {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!((50..=150).contains(&delay), "delay {} out of range", delay);
        }
    }
}
