//! Worker registry — registration, heartbeats, and lazy presence.
//!
//! Liveness is computed at read time from `last_heartbeat_at`; there is no
//! eviction sweep, so a "worker declared dead" state can never race an
//! in-flight claim.

pub mod model;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

pub use model::{WorkerRecord, WorkerRegistration};

use crate::error::RegistryError;
use crate::store::TaskStore;

/// Store-backed worker registry with a liveness TTL.
pub struct WorkerRegistry {
    store: Arc<dyn TaskStore>,
    liveness_ttl: Duration,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn TaskStore>, liveness_ttl: Duration) -> Self {
        Self {
            store,
            liveness_ttl,
        }
    }

    /// Register (or re-register) a worker. Idempotent: replaces prior
    /// scope/capability declarations.
    pub async fn register(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerRecord, RegistryError> {
        if registration.worker_id.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration {
                worker_id: registration.worker_id,
                reason: "worker_id must not be empty".to_string(),
            });
        }
        if registration.role.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration {
                worker_id: registration.worker_id,
                reason: "role must not be empty".to_string(),
            });
        }

        let record = registration.into_record();
        self.store.upsert_worker(&record).await?;
        debug!(worker_id = %record.worker_id, role = %record.role, "Worker registration accepted");
        Ok(record)
    }

    /// Replace a worker's owned codebases (its registered set reflects its
    /// current truth, not history).
    pub async fn update_scopes(
        &self,
        worker_id: &str,
        owned_codebases: &[String],
    ) -> Result<(), RegistryError> {
        self.store
            .update_worker_scopes(worker_id, owned_codebases)
            .await
    }

    /// Heartbeat: bumps `last_heartbeat_at` only.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), RegistryError> {
        self.store.touch_worker(worker_id).await
    }

    /// Look up a worker record.
    pub async fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>, RegistryError> {
        Ok(self.store.get_worker(worker_id).await?)
    }

    /// Look up a worker record, failing if unknown.
    pub async fn require(&self, worker_id: &str) -> Result<WorkerRecord, RegistryError> {
        self.get(worker_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                worker_id: worker_id.to_string(),
            })
    }

    /// Whether the worker counts as present for routing right now.
    pub fn is_live(&self, worker: &WorkerRecord) -> bool {
        worker.is_live(Utc::now(), self.liveness_ttl)
    }

    /// All workers whose heartbeat is within the liveness TTL. Dead workers
    /// are simply filtered out, never deleted.
    pub async fn live_workers(&self) -> Result<Vec<WorkerRecord>, RegistryError> {
        let now = Utc::now();
        let workers = self.store.list_workers().await?;
        Ok(workers
            .into_iter()
            .filter(|w| w.is_live(now, self.liveness_ttl))
            .collect())
    }
}
