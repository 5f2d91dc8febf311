//! Error types for flush coordination
//!
//! Covers lifecycle misuse, validation failures and transient
//! coordination store errors.

use thiserror::Error;

/// Primary error type for all coordination operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    // ========== Lifecycle Errors ==========

    /// Method called before `open` (or after `close`)
    #[error("{component} is not open")]
    NotOpen { component: &'static str },

    /// `open` called twice on the same manager
    #[error("{component} is already open")]
    AlreadyOpen { component: &'static str },

    /// `close` called on a manager that is already closed
    #[error("{component} is already closed")]
    AlreadyClosed { component: &'static str },

    // ========== Snapshot Errors ==========

    /// No placement has ever been observed
    #[error("No placement found")]
    NoPlacement,

    /// No flush times have ever been stored for the shard set
    #[error("No flush times found for shard set {shard_set_id}")]
    NoFlushTimes { shard_set_id: u32 },

    /// Local instance is absent from the placement
    #[error("Instance {instance_id} not found in placement")]
    InstanceNotFound { instance_id: String },

    /// Placement or staged placement failed validation
    #[error("Invalid placement: {reason}")]
    InvalidPlacement { reason: String },

    // ========== Validation Errors ==========

    /// Proposed watermark regresses a previously observed one
    #[error("Non-monotonic flush time for shard {shard}: current {current}, proposed {proposed}")]
    NonMonotonicUpdate { shard: u32, current: i64, proposed: i64 },

    /// Caller cancelled a context-bound call
    #[error("Operation cancelled")]
    Cancelled,

    // ========== Store Errors ==========

    /// Coordination store is unreachable or failed transiently
    #[error("Coordination store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Compare-and-swap lost against a concurrent writer
    #[error("Version mismatch for {key}: expected {expected}, actual {actual}")]
    VersionMismatch { key: String, expected: u64, actual: u64 },

    /// Lease expired or was revoked
    #[error("Lease {lease_id} expired")]
    LeaseExpired { lease_id: u64 },

    /// Stored payload could not be encoded or decoded
    #[error("Codec error: {message}")]
    Codec { message: String },

    // ========== Configuration Errors ==========

    /// Configuration could not be parsed
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl CoordError {
    /// Returns true if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::StoreUnavailable { .. }
                | CoordError::VersionMismatch { .. }
                | CoordError::LeaseExpired { .. }
        )
    }

    /// Returns true if this error indicates caller misuse of a manager lifecycle
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            CoordError::NotOpen { .. }
                | CoordError::AlreadyOpen { .. }
                | CoordError::AlreadyClosed { .. }
        )
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        CoordError::StoreUnavailable { message: message.into() }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(e: serde_json::Error) -> Self {
        CoordError::Codec { message: e.to_string() }
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoordError::store("down").is_retryable());
        assert!(CoordError::LeaseExpired { lease_id: 3 }.is_retryable());
        assert!(!CoordError::Cancelled.is_retryable());
        assert!(!CoordError::NonMonotonicUpdate { shard: 0, current: 100, proposed: 90 }.is_retryable());
    }

    #[test]
    fn test_lifecycle_classification() {
        assert!(CoordError::NotOpen { component: "election manager" }.is_lifecycle());
        assert!(CoordError::AlreadyClosed { component: "flush times manager" }.is_lifecycle());
        assert!(!CoordError::NoPlacement.is_lifecycle());
    }
}
