//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Every task transition is a
//! single conditional UPDATE checked by affected-row count; SQLite applies
//! each statement atomically, so there is no read-then-write window. libSQL
//! has no `SKIP LOCKED`, so `claim_next` scans a candidate batch and CASes
//! per row — a row lost to a concurrent claimer fails its CAS and the scan
//! moves on instead of blocking.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, RegistryError, TaskError};
use crate::registry::model::WorkerRecord;
use crate::routing::eligible;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::model::{Task, TaskRelease, TaskScope, TaskStatus};

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// One CAS claim attempt. Returns whether this caller won the row.
    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'claimed', claimed_by = ?1, attempts = attempts + 1, \
                 last_progress_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status IN ('pending', 'routed')",
                params![worker_id, now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_claim: {e}")))?;
        Ok(affected == 1)
    }

    /// Fetch a task that must exist (post-transition reads).
    async fn get_existing(&self, id: Uuid) -> Result<Task, TaskError> {
        self.get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    /// Classify a failed holder-only CAS: unknown id vs lost race.
    async fn holder_conflict(&self, id: Uuid, expected: TaskStatus) -> TaskError {
        match self.get_task(id).await {
            Ok(Some(_)) => TaskError::Conflict { id, expected },
            Ok(None) => TaskError::NotFound { id },
            Err(e) => TaskError::Database(e),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Encode a string list as a JSON text column.
fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a JSON text column into a string list.
fn decode_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

const TASK_COLUMNS: &str = "id, status, scope, target_role, required_capabilities, priority, \
    deadline_at, attempts, max_attempts, claimed_by, payload, result, failure_reason, \
    created_at, updated_at, last_progress_at";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("task.id parse: {e}")))?;

    let status_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| DatabaseError::Query(format!("unknown task status: {status_str}")))?;

    let scope_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("task.scope: {e}")))?;
    let scope = TaskScope::parse(&scope_str).map_err(DatabaseError::Query)?;

    let target_role: Option<String> = row.get(3).ok();
    let target_role = target_role.filter(|s| !s.is_empty());

    let caps_str: String = row.get(4).unwrap_or_else(|_| "[]".to_string());
    let required_capabilities = decode_list(&caps_str);

    let priority: i64 = row.get(5).unwrap_or(0);

    let deadline_str: Option<String> = row.get(6).ok();
    let deadline_at = deadline_str
        .filter(|s| !s.is_empty())
        .map(|s| parse_datetime(&s));

    let attempts: i64 = row.get(7).unwrap_or(0);
    let max_attempts: i64 = row.get(8).unwrap_or(0);

    let claimed_by: Option<String> = row.get(9).ok();
    let claimed_by = claimed_by.filter(|s| !s.is_empty());

    let payload_str: String = row.get(10).unwrap_or_else(|_| "null".to_string());
    let payload = serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null);

    let result_str: Option<String> = row.get(11).ok();
    let result = result_str
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(&s).ok());

    let failure_reason: Option<String> = row.get(12).ok();
    let failure_reason = failure_reason.filter(|s| !s.is_empty());

    let created_str: String = row.get(13).unwrap_or_default();
    let updated_str: String = row.get(14).unwrap_or_default();
    let progress_str: String = row.get(15).unwrap_or_default();

    Ok(Task {
        id,
        status,
        scope,
        target_role,
        required_capabilities,
        priority,
        deadline_at,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        claimed_by,
        payload,
        result,
        failure_reason,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        last_progress_at: parse_datetime(&progress_str),
    })
}

const WORKER_COLUMNS: &str =
    "worker_id, role, owned_codebases, capabilities, last_heartbeat_at, registered_at";

/// Map a libsql Row to a WorkerRecord. Column order matches WORKER_COLUMNS.
fn row_to_worker(row: &libsql::Row) -> Result<WorkerRecord, DatabaseError> {
    let worker_id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("worker.worker_id: {e}")))?;
    let role: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("worker.role: {e}")))?;

    let codebases_str: String = row.get(2).unwrap_or_else(|_| "[]".to_string());
    let capabilities_str: String = row.get(3).unwrap_or_else(|_| "[]".to_string());
    let heartbeat_str: String = row.get(4).unwrap_or_default();
    let registered_str: String = row.get(5).unwrap_or_default();

    Ok(WorkerRecord {
        worker_id,
        role,
        owned_codebases: decode_list(&codebases_str),
        capabilities: decode_list(&capabilities_str),
        last_heartbeat_at: parse_datetime(&heartbeat_str),
        registered_at: parse_datetime(&registered_str),
    })
}

#[async_trait]
impl TaskStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO tasks (id, status, scope, target_role, required_capabilities, \
                 priority, deadline_at, attempts, max_attempts, claimed_by, payload, result, \
                 failure_reason, created_at, updated_at, last_progress_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    task.id.to_string(),
                    task.status.as_str(),
                    task.scope.as_string(),
                    task.target_role.clone(),
                    encode_list(&task.required_capabilities),
                    task.priority,
                    task.deadline_at.map(|d| d.to_rfc3339()),
                    task.attempts as i64,
                    task.max_attempts as i64,
                    task.claimed_by.clone(),
                    payload,
                    task.result
                        .as_ref()
                        .and_then(|v| serde_json::to_string(v).ok()),
                    task.failure_reason.clone(),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                    task.last_progress_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        debug!(task_id = %task.id, scope = %task.scope, "Task created");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    // ── Claim protocol ──────────────────────────────────────────────

    async fn claim_next(
        &self,
        worker: &WorkerRecord,
        batch: usize,
    ) -> Result<Option<Task>, TaskError> {
        let now = Utc::now();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status IN ('pending', 'routed') \
                       AND (deadline_at IS NULL OR deadline_at > ?1) \
                     ORDER BY priority DESC, created_at ASC LIMIT ?2"
                ),
                params![now.to_rfc3339(), batch as i64],
            )
            .await
            .map_err(|e| TaskError::Database(DatabaseError::Query(format!("claim_next: {e}"))))?;

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            candidates.push(row_to_task(&row)?);
        }

        for candidate in candidates {
            if !eligible(&candidate, worker, now) {
                continue;
            }
            // Lost rows fail the CAS and the scan moves to the next candidate.
            if self.try_claim(candidate.id, &worker.worker_id, now).await? {
                let task = self.get_existing(candidate.id).await?;
                debug!(
                    task_id = %task.id,
                    worker_id = %worker.worker_id,
                    attempt = task.attempts,
                    "Task claimed"
                );
                return Ok(Some(task));
            }
        }

        Ok(None)
    }

    async fn claim_task(&self, worker: &WorkerRecord, id: Uuid) -> Result<Task, TaskError> {
        let now = Utc::now();
        let task = self.get_task(id).await?.ok_or(TaskError::NotFound { id })?;

        if task.deadline_passed(now) {
            return Err(TaskError::DeadlineExceeded { id });
        }
        // Already won by someone else, or the worker isn't eligible: either
        // way the caller lost this task and should move on.
        if !task.status.is_claimable() || !eligible(&task, worker, now) {
            return Err(TaskError::Conflict {
                id,
                expected: TaskStatus::Pending,
            });
        }

        if self.try_claim(id, &worker.worker_id, now).await? {
            self.get_existing(id).await
        } else {
            Err(TaskError::Conflict {
                id,
                expected: TaskStatus::Pending,
            })
        }
    }

    // ── Claim-holder transitions ────────────────────────────────────

    async fn mark_running(&self, id: Uuid, worker_id: &str) -> Result<(), TaskError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'running', last_progress_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND claimed_by = ?3 AND status IN ('claimed', 'running')",
                params![now, id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_running: {e}")))?;

        if affected == 1 {
            Ok(())
        } else {
            Err(self.holder_conflict(id, TaskStatus::Claimed).await)
        }
    }

    async fn record_progress(&self, id: Uuid, worker_id: &str) -> Result<(), TaskError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET last_progress_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND claimed_by = ?3 AND status IN ('claimed', 'running')",
                params![now, id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_progress: {e}")))?;

        if affected == 1 {
            Ok(())
        } else {
            Err(self.holder_conflict(id, TaskStatus::Running).await)
        }
    }

    async fn release_task(&self, id: Uuid, release: &TaskRelease) -> Result<Task, TaskError> {
        if !matches!(release.status, TaskStatus::Completed | TaskStatus::Failed) {
            let current = self.get_existing(id).await?;
            return Err(TaskError::InvalidTransition {
                id,
                from: current.status,
                to: release.status,
            });
        }

        let now = Utc::now().to_rfc3339();
        let result = release
            .result
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok());

        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, result = ?2, failure_reason = ?3, \
                 claimed_by = NULL, last_progress_at = ?4, updated_at = ?4 \
                 WHERE id = ?5 AND claimed_by = ?6 AND status IN ('claimed', 'running')",
                params![
                    release.status.as_str(),
                    result,
                    release.failure_reason.clone(),
                    now,
                    id.to_string(),
                    release.worker_id.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_task: {e}")))?;

        if affected == 1 {
            let task = self.get_existing(id).await?;
            debug!(task_id = %id, status = %task.status, "Task released");
            Ok(task)
        } else {
            Err(self.holder_conflict(id, TaskStatus::Running).await)
        }
    }

    // ── Producer / operator ─────────────────────────────────────────

    async fn cancel_task(&self, id: Uuid) -> Result<Task, TaskError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE tasks SET status = 'cancelled', claimed_by = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_task: {e}")))?;

        // Zero affected rows means the task was already terminal — cancel is
        // an idempotent no-op there, only an unknown id is an error.
        self.get_existing(id).await
    }

    // ── Fan-out advisory ────────────────────────────────────────────

    async fn mark_routed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'routed', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_routed: {e}")))?;
        Ok(affected == 1)
    }

    // ── Reaper scans & transitions ──────────────────────────────────

    async fn stuck_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'running' AND last_progress_at <= ?1 \
                     ORDER BY last_progress_at ASC"
                ),
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stuck_running: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn deadline_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status IN ('pending', 'routed', 'claimed') \
                       AND deadline_at IS NOT NULL AND deadline_at <= ?1 \
                     ORDER BY deadline_at ASC"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deadline_expired: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn requeue_task(&self, id: Uuid, cutoff: DateTime<Utc>) -> Result<Task, TaskError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'pending', claimed_by = NULL, \
                 attempts = attempts + 1, last_progress_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'running' AND last_progress_at <= ?3",
                params![now, id.to_string(), cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_task: {e}")))?;

        if affected == 1 {
            self.get_existing(id).await
        } else {
            // A heartbeat or terminal release landed between scan and CAS.
            Err(self.holder_conflict(id, TaskStatus::Running).await)
        }
    }

    async fn fail_task(
        &self,
        id: Uuid,
        expected: TaskStatus,
        reason: &str,
    ) -> Result<Task, TaskError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', failure_reason = ?1, \
                 claimed_by = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![reason, now, id.to_string(), expected.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;

        if affected == 1 {
            self.get_existing(id).await
        } else {
            Err(self.holder_conflict(id, expected).await)
        }
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn upsert_worker(&self, record: &WorkerRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO workers (worker_id, role, owned_codebases, capabilities, \
                 last_heartbeat_at, registered_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(worker_id) DO UPDATE SET \
                 role = excluded.role, owned_codebases = excluded.owned_codebases, \
                 capabilities = excluded.capabilities, \
                 last_heartbeat_at = excluded.last_heartbeat_at",
                params![
                    record.worker_id.as_str(),
                    record.role.as_str(),
                    encode_list(&record.owned_codebases),
                    encode_list(&record.capabilities),
                    record.last_heartbeat_at.to_rfc3339(),
                    record.registered_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_worker: {e}")))?;

        debug!(worker_id = %record.worker_id, role = %record.role, "Worker registered");
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?1"),
                params![worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_worker: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_worker(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_worker: {e}"))),
        }
    }

    async fn update_worker_scopes(
        &self,
        worker_id: &str,
        owned_codebases: &[String],
    ) -> Result<(), RegistryError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE workers SET owned_codebases = ?1, last_heartbeat_at = ?2 \
                 WHERE worker_id = ?3",
                params![encode_list(owned_codebases), now, worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_worker_scopes: {e}")))?;

        if affected == 1 {
            Ok(())
        } else {
            Err(RegistryError::NotFound {
                worker_id: worker_id.to_string(),
            })
        }
    }

    async fn touch_worker(&self, worker_id: &str) -> Result<(), RegistryError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE workers SET last_heartbeat_at = ?1 WHERE worker_id = ?2",
                params![now, worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_worker: {e}")))?;

        if affected == 1 {
            Ok(())
        } else {
            Err(RegistryError::NotFound {
                worker_id: worker_id.to_string(),
            })
        }
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY registered_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            workers.push(row_to_worker(&row)?);
        }
        Ok(workers)
    }
}
