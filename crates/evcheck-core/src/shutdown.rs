use std::sync::Arc;

use tokio::sync::watch;

/// Run-wide cancellation handle. Cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Non-blocking check, usable from worker threads.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires, or immediately if it already has.
    pub async fn triggered(mut self) {
        // Err means the sender is gone; nothing can fire after that.
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_visible_to_listeners() {
        let shutdown = Shutdown::new();
        let listener = shutdown.listener();
        assert!(!listener.is_triggered());

        shutdown.trigger();
        shutdown.trigger();
        assert!(listener.is_triggered());
        assert!(shutdown.listener().is_triggered());
    }

    #[tokio::test]
    async fn test_triggered_resolves() {
        let shutdown = Shutdown::new();
        let listener = shutdown.listener();
        let waiter = tokio::spawn(listener.triggered());
        shutdown.clone().trigger();
        waiter.await.unwrap();
    }
}
