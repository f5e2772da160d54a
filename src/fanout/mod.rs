//! Notification fan-out — advisory "task available" hints.
//!
//! One outbound stream per connected worker. Hints carry only the task id
//! and scope, never the payload, and are fire-and-forget: delivery is not
//! tracked, duplicates and drops are fine, and the claim protocol stays the
//! sole authority. A worker that misses every hint still finds work by
//! polling `claim_next`.

pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::WorkerRegistry;
use crate::routing::eligible;
use crate::store::TaskStore;
use crate::tasks::model::{Task, TaskScope};

/// Messages pushed to a worker's stream (engine → worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Registration acknowledged; the stream is attached.
    Registered { worker_id: String },
    /// A task this worker may be eligible for exists. Advisory only.
    TaskAvailable { task_id: Uuid, scope: TaskScope },
}

/// Actions a worker can send over the WebSocket (worker → engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerAction {
    /// Register (or re-register) and attach the hint stream.
    Register {
        worker_id: String,
        role: String,
        #[serde(default)]
        owned_codebases: Vec<String>,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Keep-alive; refreshes presence.
    Heartbeat { worker_id: String },
}

/// An attached stream sender, tagged with an epoch so a reconnect can
/// replace it without the old connection's teardown detaching the new one.
struct AttachedStream {
    epoch: u64,
    tx: mpsc::UnboundedSender<StreamMessage>,
}

/// Per-worker outbound streams.
#[derive(Default)]
pub struct StreamManager {
    streams: RwLock<HashMap<String, AttachedStream>>,
    next_epoch: std::sync::atomic::AtomicU64,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a stream for `worker_id`, replacing any previous one (the
    /// latest connection wins). Returns the receiver and the epoch to pass
    /// back to `detach`.
    pub async fn attach(&self, worker_id: &str) -> (u64, mpsc::UnboundedReceiver<StreamMessage>) {
        let epoch = self
            .next_epoch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .streams
            .write()
            .await
            .insert(worker_id.to_string(), AttachedStream { epoch, tx });
        if previous.is_some() {
            debug!(worker_id, "Replaced existing worker stream");
        }
        (epoch, rx)
    }

    /// Detach the stream, but only if it is still the one attached at
    /// `epoch` — a reconnected worker's fresh stream is left alone.
    pub async fn detach(&self, worker_id: &str, epoch: u64) {
        let mut streams = self.streams.write().await;
        if streams.get(worker_id).is_some_and(|s| s.epoch == epoch) {
            streams.remove(worker_id);
        }
    }

    /// Push a message to one worker. Returns false if it has no stream.
    pub async fn send_to(&self, worker_id: &str, message: StreamMessage) -> bool {
        let streams = self.streams.read().await;
        match streams.get(worker_id) {
            Some(stream) => stream.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Number of currently attached streams.
    pub async fn connected_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

/// Advertise a claimable task to every live, eligible, connected worker.
///
/// Purely an optimization over polling: failures here are logged and
/// swallowed, never propagated — correctness lives in the claim path.
pub async fn advertise_task(
    task: &Task,
    registry: &WorkerRegistry,
    streams: &StreamManager,
    store: &Arc<dyn TaskStore>,
) {
    let now = chrono::Utc::now();
    let workers = match registry.live_workers().await {
        Ok(workers) => workers,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Failed to list live workers for fan-out");
            return;
        }
    };

    let mut notified = 0usize;
    for worker in workers.iter().filter(|w| eligible(task, w, now)) {
        let hint = StreamMessage::TaskAvailable {
            task_id: task.id,
            scope: task.scope.clone(),
        };
        if streams.send_to(&worker.worker_id, hint).await {
            notified += 1;
        }
    }

    if notified > 0 {
        debug!(task_id = %task.id, notified, "Task advertised");
        // Advisory flip; losing the race to a fast claimer is fine.
        if let Err(e) = store.mark_routed(task.id).await {
            warn!(task_id = %task.id, error = %e, "Failed to mark task routed");
        }
    }
}
