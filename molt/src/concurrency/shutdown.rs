use tokio::sync::watch;

/// Transmitter side of the shutdown coordination channel.
///
/// Cloneable; any holder can initiate shutdown, and all receivers observe it
/// simultaneously.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiver side of the shutdown coordination channel.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Non-blocking check, used between units of work.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves when shutdown is signalled. Used inside `select!` arms.
    pub async fn wait_for_shutdown(&mut self) {
        // An error means the sender dropped, which we treat as shutdown.
        let _ = self.0.wait_for(|signalled| *signalled).await;
    }
}

/// Creates the shutdown channel in the not-shut-down state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_is_observed_by_all_receivers() {
        let (tx, rx1) = create_shutdown_channel();
        let mut rx2 = tx.subscribe();

        assert!(!rx1.is_shutdown());
        tx.shutdown();
        assert!(rx1.is_shutdown());
        rx2.wait_for_shutdown().await;
        assert!(rx2.is_shutdown());
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = create_shutdown_channel();
        drop(tx);
        rx.wait_for_shutdown().await;
    }
}
