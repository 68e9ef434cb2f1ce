//! Background JSON decoding worker.
//!
//! A single long-lived task drains decode jobs from a channel so heavyweight
//! payloads do not stall driver tasks. Jobs carry a monotonically increasing
//! event id and are answered on per-job reply channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const QUEUE_DEPTH: usize = 64;

struct DecodeJob {
    event_id: u64,
    payload: String,
    reply: oneshot::Sender<Result<Value, serde_json::Error>>,
}

#[derive(Clone)]
pub struct JsonWorker {
    tx: mpsc::Sender<DecodeJob>,
    next_event_id: Arc<AtomicU64>,
}

impl JsonWorker {
    /// Start the worker task. Dropping every handle shuts it down.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<DecodeJob>(QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = serde_json::from_str(&job.payload);
                if job.reply.send(result).is_err() {
                    debug!(event_id = job.event_id, "decode requester went away");
                }
            }
            debug!("json worker stopped");
        });

        Self {
            tx,
            next_event_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn decode(&self, payload: String) -> anyhow::Result<Value> {
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DecodeJob {
                event_id,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("json worker stopped"))?;

        let decoded = reply_rx
            .await
            .map_err(|_| anyhow!("json worker dropped job {event_id}"))??;
        Ok(decoded)
    }
}
