//! Unified `TaskStore` trait — single async interface for all persistence.
//!
//! Every state transition is a single conditional update against one row
//! (compare-and-swap on `status`, plus `claimed_by` for holder-only calls).
//! A failed CAS surfaces as `TaskError::Conflict`, which callers treat as
//! losing a race, not as a fault.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, RegistryError, TaskError};
use crate::registry::model::WorkerRecord;
use crate::tasks::model::{Task, TaskRelease, TaskStatus};

/// Backend-agnostic store covering tasks and worker records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task (status `pending`).
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID with its full field set.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// List tasks in a given status, oldest first.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    // ── Claim protocol ──────────────────────────────────────────────

    /// Claim the highest-priority, oldest claimable task eligible for
    /// `worker`. Scans up to `batch` candidates; a candidate lost to a
    /// concurrent claimer is skipped, not waited on. `Ok(None)` means no
    /// eligible work — not an error.
    async fn claim_next(
        &self,
        worker: &WorkerRecord,
        batch: usize,
    ) -> Result<Option<Task>, TaskError>;

    /// Claim one named task. Fails with `Conflict` when another worker
    /// already won it — the expected outcome of losing a race.
    async fn claim_task(&self, worker: &WorkerRecord, id: Uuid) -> Result<Task, TaskError>;

    // ── Claim-holder transitions ────────────────────────────────────

    /// Move a claimed task to `running`. Idempotent for the claim holder.
    async fn mark_running(&self, id: Uuid, worker_id: &str) -> Result<(), TaskError>;

    /// Heartbeat: bump `last_progress_at` only. Holder-only.
    async fn record_progress(&self, id: Uuid, worker_id: &str) -> Result<(), TaskError>;

    /// Terminal release to `completed` or `failed`. Holder-only, irreversible.
    async fn release_task(&self, id: Uuid, release: &TaskRelease) -> Result<Task, TaskError>;

    // ── Producer / operator ─────────────────────────────────────────

    /// Cancel from any non-terminal state. A no-op (not an error) when the
    /// task is already terminal; `NotFound` only for unknown ids.
    async fn cancel_task(&self, id: Uuid) -> Result<Task, TaskError>;

    // ── Fan-out advisory ────────────────────────────────────────────

    /// Advisory `pending → routed` flip after hints were delivered.
    /// Returns whether the flip happened; losing the race is fine.
    async fn mark_routed(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Reaper scans & transitions ──────────────────────────────────

    /// Running tasks with no progress since `cutoff`.
    async fn stuck_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Unfinished tasks (pending/routed/claimed) whose deadline has passed.
    async fn deadline_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Requeue a stuck running task: `running → pending`, `attempts += 1`,
    /// clear `claimed_by`. Conditional on `last_progress_at <= cutoff` so a
    /// racing heartbeat wins over the reaper.
    async fn requeue_task(&self, id: Uuid, cutoff: DateTime<Utc>) -> Result<Task, TaskError>;

    /// Terminally fail a task from an expected status with a reason.
    async fn fail_task(
        &self,
        id: Uuid,
        expected: TaskStatus,
        reason: &str,
    ) -> Result<Task, TaskError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Insert or replace a worker record (registration is idempotent and
    /// replaces prior declarations).
    async fn upsert_worker(&self, record: &WorkerRecord) -> Result<(), DatabaseError>;

    /// Get a worker record by ID.
    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError>;

    /// Replace (not merge) a worker's owned codebases.
    async fn update_worker_scopes(
        &self,
        worker_id: &str,
        owned_codebases: &[String],
    ) -> Result<(), RegistryError>;

    /// Bump `last_heartbeat_at` only; no status side effects.
    async fn touch_worker(&self, worker_id: &str) -> Result<(), RegistryError>;

    /// All registered workers (liveness is the caller's read-time filter).
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, DatabaseError>;
}
