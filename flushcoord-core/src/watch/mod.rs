//! Change notification
//!
//! [`Watchable`] is an observable value with independent subscriber
//! handles; [`KeyedWatcher`] shares one store subscription per key among
//! any number of them.

pub mod keyed;
pub mod watchable;

pub use keyed::{Decoder, KeyedWatcher, WatchConfig};
pub use watchable::{Versioned, Watch, Watchable};
