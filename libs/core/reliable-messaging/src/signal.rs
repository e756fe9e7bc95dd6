//! Cancellation shared by consumer loops and delayed dispatch

use tokio::sync::watch;

/// Fires when either the caller's shutdown channel or the client's own
/// `close()` flips to `true`.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    external: watch::Receiver<bool>,
    closing: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(external: watch::Receiver<bool>, closing: watch::Receiver<bool>) -> Self {
        Self { external, closing }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.external.borrow() || *self.closing.borrow()
    }

    /// Resolve once cancelled. A dropped sender never cancels.
    pub async fn cancelled(&self) {
        let mut external = self.external.clone();
        let mut closing = self.closing.clone();

        tokio::select! {
            _ = wait_true(&mut external) => {}
            _ = wait_true(&mut closing) => {}
        }
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_external_shutdown() {
        let (external_tx, external_rx) = watch::channel(false);
        let (_closing_tx, closing_rx) = watch::channel(false);
        let signal = ShutdownSignal::new(external_rx, closing_rx);

        assert!(!signal.is_cancelled());
        external_tx.send(true).unwrap();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_client_close() {
        let (_external_tx, external_rx) = watch::channel(false);
        let (closing_tx, closing_rx) = watch::channel(false);
        let signal = ShutdownSignal::new(external_rx, closing_rx);

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        closing_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_sender_does_not_cancel() {
        let (external_tx, external_rx) = watch::channel(false);
        let (_closing_tx, closing_rx) = watch::channel(false);
        let signal = ShutdownSignal::new(external_rx, closing_rx);
        drop(external_tx);

        let fired = tokio::time::timeout(Duration::from_millis(30), signal.cancelled()).await;
        assert!(fired.is_err());
        assert!(!signal.is_cancelled());
    }
}
