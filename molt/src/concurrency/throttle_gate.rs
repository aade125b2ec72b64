use tokio::sync::watch;

use crate::context::ThrottleReason;

/// Transmitter side of the throttle gate.
///
/// The throttler publishes its per-tick decision here; pipelines observe it
/// between units of work and block while a reason is present. In-flight
/// transactions are never interrupted.
#[derive(Debug, Clone)]
pub struct ThrottleGate(watch::Sender<Option<ThrottleReason>>);

impl ThrottleGate {
    pub fn publish(&self, reason: Option<ThrottleReason>) {
        // send_replace so publishing works before any pipeline subscribes.
        self.0.send_replace(reason);
    }

    pub fn subscribe(&self) -> ThrottleWatch {
        ThrottleWatch(self.0.subscribe())
    }
}

/// Receiver side of the throttle gate.
#[derive(Debug, Clone)]
pub struct ThrottleWatch(watch::Receiver<Option<ThrottleReason>>);

impl ThrottleWatch {
    pub fn current_reason(&self) -> Option<ThrottleReason> {
        self.0.borrow().clone()
    }

    pub fn is_throttled(&self) -> bool {
        self.0.borrow().is_some()
    }

    /// Blocks until no throttle reason is present. Returns immediately when
    /// the gate is clear. A dropped transmitter clears the gate.
    pub async fn wait_until_clear(&mut self) {
        let _ = self.0.wait_for(|reason| reason.is_none()).await;
    }
}

/// Creates the throttle gate in the clear state.
pub fn create_throttle_gate() -> (ThrottleGate, ThrottleWatch) {
    let (tx, rx) = watch::channel(None);
    (ThrottleGate(tx), ThrottleWatch(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_starts_clear() {
        let (_gate, mut watch) = create_throttle_gate();
        assert!(!watch.is_throttled());
        watch.wait_until_clear().await;
    }

    #[tokio::test]
    async fn gate_blocks_until_cleared() {
        let (gate, mut watch) = create_throttle_gate();
        gate.publish(Some(ThrottleReason::CommandedByUser));
        assert!(watch.is_throttled());

        let waiter = tokio::spawn(async move {
            watch.wait_until_clear().await;
            watch
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.publish(None);
        let watch = waiter.await.unwrap();
        assert!(!watch.is_throttled());
    }
}
