//! Single-fire completion slot for request outcomes.

use tokio::sync::watch;

use crate::response::Response;

/// One-shot result slot shared between a request's caller and the manager.
///
/// The slot is written at most once; later writes are silently discarded.
/// Clones observe the same slot, and a completed value is never cleared, so
/// any number of waiters may read it.
#[derive(Debug, Clone)]
pub struct CompletionSlot {
    tx: watch::Sender<Option<Response>>,
    rx: watch::Receiver<Option<Response>>,
}

impl CompletionSlot {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx, rx }
    }

    /// Fill the slot. Returns `true` if this call won the write; a `false`
    /// return means the slot was already completed and the value was dropped.
    pub fn complete(&self, response: Response) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(response);
            true
        })
    }

    pub fn is_completed(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Peek at the result without waiting.
    pub fn result(&self) -> Option<Response> {
        self.rx.borrow().clone()
    }

    /// Await the result.
    pub async fn wait(&self) -> Response {
        let mut rx = self.rx.clone();
        // The sender lives inside self, so the channel cannot close before
        // the slot is filled.
        let value = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("completion channel closed");
        value.clone().expect("completion slot observed empty")
    }
}

impl Default for CompletionSlot {
    fn default() -> Self {
        Self::new()
    }
}
