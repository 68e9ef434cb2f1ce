//! One-shot gates used for init and suspend signaling.

use tokio::sync::watch;

/// A manually-opened gate. Waiters park until [`Gate::open`] fires; once open,
/// every current and future wait returns immediately. A gate cannot be closed
/// again: suspend cycles install a fresh gate instead, so waiters from a
/// prior cycle are always drained by the resume that matches them.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Open the gate, releasing all waiters atomically. Idempotent.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside self, so the channel cannot close under us.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn open_releases_current_and_future_waiters() {
        let gate = Gate::new();
        assert!(!gate.is_open());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.open();
        waiter.await.unwrap();

        // Late waiters pass straight through.
        gate.wait().await;
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let gate = Gate::new();
        gate.open();
        gate.open();
        gate.wait().await;
    }
}
