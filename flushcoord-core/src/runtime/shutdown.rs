//! Shutdown signalling for background tasks
//!
//! Backed by a watch channel so a task that subscribes after the signal
//! fired still observes it.

use std::sync::Arc;
use tokio::sync::watch;

/// Shutdown signal shared between a manager and its background tasks
///
/// Clones share one channel; each task takes its own listener via `subscribe`.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    /// Whether shutdown has been triggered
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Create a new listener for this signal
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a [`ShutdownSignal`]
#[derive(Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered
    pub async fn recv(&mut self) {
        // An error means the signal was dropped, which also ends the task.
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }

    /// Whether shutdown has been triggered
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_the_signal() {
        let signal = ShutdownSignal::new();
        let mut listeners: Vec<_> = (0..3).map(|_| signal.subscribe()).collect();
        let tasks: Vec<_> = listeners
            .drain(..)
            .map(|mut l| tokio::spawn(async move { l.recv().await }))
            .collect();

        signal.clone().shutdown();
        assert!(signal.is_shutdown());
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let signal = ShutdownSignal::new();
        signal.shutdown();

        let mut listener = signal.subscribe();
        assert!(listener.is_shutdown());
        listener.recv().await;
    }
}
