//! Cooperative shutdown for background workers

use std::sync::Arc;
use tokio::sync::watch;

/// Broadcast shutdown flag.
///
/// Cloned into every background worker; workers `select!` on [`wait`](Self::wait)
/// next to their tick so they react promptly instead of finishing a sleep.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create an untriggered signal
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Trigger shutdown for every clone of this signal
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Whether shutdown has been triggered
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this only returns on trigger
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        assert!(!signal.is_triggered());
        signal.trigger();

        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(joined.is_ok());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let waited = tokio::time::timeout(Duration::from_millis(100), signal.wait()).await;
        assert!(waited.is_ok());
    }
}
