//! Task reaper — recovers stuck and expired tasks.
//!
//! Runs on a fixed interval (first tick immediate). Each cycle requeues
//! running tasks that stopped making progress, terminally fails tasks whose
//! retry budget is spent, and expires tasks past their deadline. Every
//! transition goes through the same CAS store calls as any other caller, so
//! concurrent reapers are safe: at most one wins each transition and the
//! losers see `Conflict`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::TaskError;
use crate::fanout::{StreamManager, advertise_task};
use crate::registry::WorkerRegistry;
use crate::store::TaskStore;
use crate::tasks::model::{
    REASON_DEADLINE_EXCEEDED, REASON_MAX_ATTEMPTS_EXCEEDED, Task, TaskStatus,
};

/// Receiver for terminal-failure notifications. Delivery content and
/// transport belong to an external collaborator; the default just logs.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn task_failed(&self, task: &Task);
}

/// Default notifier: structured log only.
pub struct LogNotifier;

#[async_trait]
impl FailureNotifier for LogNotifier {
    async fn task_failed(&self, task: &Task) {
        warn!(
            task_id = %task.id,
            reason = task.failure_reason.as_deref().unwrap_or("unknown"),
            attempts = task.attempts,
            "Task failed terminally"
        );
    }
}

/// Snapshot of reaper activity for the introspection endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaperSnapshot {
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    pub last_cycle_finished_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub requeued_total: u64,
    pub exhausted_total: u64,
    pub expired_total: u64,
    pub is_scanning: bool,
}

/// Shared reaper telemetry.
#[derive(Default)]
pub struct ReaperTelemetry {
    inner: Mutex<ReaperSnapshot>,
}

impl ReaperTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ReaperSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn mark_started(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_cycle_started_at = Some(Utc::now());
        inner.is_scanning = true;
    }

    fn mark_finished(&self, requeued: u64, exhausted: u64, expired: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_cycle_finished_at = Some(Utc::now());
        inner.cycles += 1;
        inner.requeued_total += requeued;
        inner.exhausted_total += exhausted;
        inner.expired_total += expired;
        inner.is_scanning = false;
    }
}

/// Everything one reaper cycle needs.
pub struct ReaperDeps {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<WorkerRegistry>,
    pub streams: Arc<StreamManager>,
    pub telemetry: Arc<ReaperTelemetry>,
    pub notifier: Arc<dyn FailureNotifier>,
}

/// Spawn the reaper background loop.
pub fn spawn_reaper_loop(deps: ReaperDeps, config: DispatchConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = config.reaper_interval.as_secs(),
            stuck_timeout_secs = config.stuck_timeout.as_secs(),
            "Reaper loop started"
        );

        let mut tick = tokio::time::interval(config.reaper_interval);

        // First tick fires immediately
        loop {
            tick.tick().await;
            run_reaper_cycle(&deps, &config).await;
        }
    })
}

/// Single sweep: requeue/fail stuck running tasks, then expire deadlines.
///
/// Public so tests can drive cycles without waiting on the interval.
pub async fn run_reaper_cycle(deps: &ReaperDeps, config: &DispatchConfig) {
    deps.telemetry.mark_started();

    let now = Utc::now();
    let cutoff = now
        - chrono::Duration::from_std(config.stuck_timeout).unwrap_or(chrono::Duration::zero());

    let (requeued, exhausted) = sweep_stuck(deps, cutoff).await;
    let expired = sweep_deadlines(deps, now).await;

    deps.telemetry.mark_finished(requeued, exhausted, expired);

    if requeued + exhausted + expired > 0 {
        info!(requeued, exhausted, expired, "Reaper cycle recovered tasks");
    }
}

/// Requeue stuck running tasks, or fail them when the budget is spent.
async fn sweep_stuck(deps: &ReaperDeps, cutoff: DateTime<Utc>) -> (u64, u64) {
    let stuck = match deps.store.stuck_running(cutoff).await {
        Ok(stuck) => stuck,
        Err(e) => {
            warn!(error = %e, "Failed to scan for stuck tasks");
            return (0, 0);
        }
    };

    let mut requeued = 0u64;
    let mut exhausted = 0u64;

    for task in stuck {
        if task.attempts >= task.max_attempts {
            match deps
                .store
                .fail_task(task.id, TaskStatus::Running, REASON_MAX_ATTEMPTS_EXCEEDED)
                .await
            {
                Ok(failed) => {
                    exhausted += 1;
                    deps.notifier.task_failed(&failed).await;
                }
                Err(TaskError::Conflict { .. }) => {
                    debug!(task_id = %task.id, "Lost stuck-fail race; task moved on");
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to fail stuck task"),
            }
        } else {
            match deps.store.requeue_task(task.id, cutoff).await {
                Ok(reborn) => {
                    requeued += 1;
                    info!(
                        task_id = %reborn.id,
                        attempts = reborn.attempts,
                        "Stuck task requeued"
                    );
                    // Immediately re-claimable, so re-advertise it.
                    advertise_task(&reborn, &deps.registry, &deps.streams, &deps.store).await;
                }
                Err(TaskError::Conflict { .. }) => {
                    debug!(task_id = %task.id, "Lost requeue race; a heartbeat or release won");
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to requeue stuck task"),
            }
        }
    }

    (requeued, exhausted)
}

/// Terminally fail unclaimed/claimed tasks whose deadline has passed.
async fn sweep_deadlines(deps: &ReaperDeps, now: DateTime<Utc>) -> u64 {
    let overdue = match deps.store.deadline_expired(now).await {
        Ok(overdue) => overdue,
        Err(e) => {
            warn!(error = %e, "Failed to scan for expired deadlines");
            return 0;
        }
    };

    let mut expired = 0u64;
    for task in overdue {
        match deps
            .store
            .fail_task(task.id, task.status, REASON_DEADLINE_EXCEEDED)
            .await
        {
            Ok(failed) => {
                expired += 1;
                deps.notifier.task_failed(&failed).await;
            }
            Err(TaskError::Conflict { .. }) => {
                debug!(task_id = %task.id, "Lost deadline-fail race; task moved on");
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to expire task"),
        }
    }
    expired
}
