//! Worker data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered worker process instance.
///
/// Multiple instances may share a `role`; `worker_id` is unique per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Unique per connected process instance, supplied by the worker.
    pub worker_id: String,
    /// Stable logical identity used for targeted routing.
    pub role: String,
    /// Codebases this worker accepts scoped tasks for. Empty means only
    /// `global` and `pending-registration` work — never "all".
    #[serde(default)]
    pub owned_codebases: Vec<String>,
    /// Declared capability set.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Updated on every heartbeat, claim, or status call.
    pub last_heartbeat_at: DateTime<Utc>,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Whether this worker counts as present for routing at `now`.
    pub fn is_live(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        now.signed_duration_since(self.last_heartbeat_at) < ttl
    }
}

/// A registration request from a worker. Re-registering replaces prior
/// scope/capability declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub role: String,
    #[serde(default)]
    pub owned_codebases: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl WorkerRegistration {
    /// Materialize a worker record, stamping heartbeat/registration times.
    pub fn into_record(self) -> WorkerRecord {
        let now = Utc::now();
        WorkerRecord {
            worker_id: self.worker_id,
            role: self.role,
            owned_codebases: self.owned_codebases,
            capabilities: self.capabilities,
            last_heartbeat_at: now,
            registered_at: now,
        }
    }
}
