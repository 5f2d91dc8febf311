//! Background task plumbing shared by the managers
//!
//! Shutdown signalling and retry backoff.

pub mod backoff;
pub mod shutdown;

pub use backoff::{Backoff, BackoffConfig};
pub use shutdown::{ShutdownListener, ShutdownSignal};
