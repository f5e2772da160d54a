//! Task data model — status state machine, scopes, and request types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// `Routed` is advisory: the fan-out layer sets it after delivering hints,
/// and every claimable-status check treats it exactly like `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker to claim it.
    Pending,
    /// Hints delivered to at least one eligible worker; still claimable.
    Routed,
    /// Exactly one worker holds the claim.
    Claimed,
    /// The claiming worker reported it started execution.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully, or expired/exhausted by the reaper.
    Failed,
    /// Cancelled before reaching a terminal result.
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Routed) | (Pending, Claimed) | (Pending, Failed) | (Pending, Cancelled) |
            // From Routed (claimable, same exits as Pending)
            (Routed, Claimed) | (Routed, Failed) | (Routed, Cancelled) |
            // From Claimed
            (Claimed, Running) | (Claimed, Completed) | (Claimed, Failed) |
            (Claimed, Cancelled) | (Claimed, Pending) |
            // From Running (Pending = reaper requeue)
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) | (Running, Pending)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if a task in this state can still be claimed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Routed)
    }

    /// DB string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Routed => "routed",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the DB string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "routed" => Some(Self::Routed),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Eligibility domain of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TaskScope {
    /// Any worker is eligible.
    Global,
    /// Only workers that registered this codebase.
    Codebase(String),
    /// Any worker, including one with no codebases yet — lets a brand-new
    /// worker discover setup tasks.
    PendingRegistration,
}

impl TaskScope {
    pub fn as_string(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Codebase(id) => format!("codebase:{id}"),
            Self::PendingRegistration => "pending-registration".to_string(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "global" => Ok(Self::Global),
            "pending-registration" => Ok(Self::PendingRegistration),
            other => match other.strip_prefix("codebase:") {
                Some(id) if !id.is_empty() => Ok(Self::Codebase(id.to_string())),
                _ => Err(format!("invalid task scope: {other:?}")),
            },
        }
    }
}

impl From<TaskScope> for String {
    fn from(scope: TaskScope) -> String {
        scope.as_string()
    }
}

impl TryFrom<String> for TaskScope {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl std::fmt::Display for TaskScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// A unit of work routed to exactly one worker at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID, immutable.
    pub id: Uuid,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Eligibility domain.
    pub scope: TaskScope,
    /// Exact-match routing identity; when set, only workers with this role
    /// are eligible (scope and capability checks still apply).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_role: Option<String>,
    /// Capabilities a worker must declare a superset of.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Higher priority is claimed first among eligible tasks.
    pub priority: i64,
    /// Once passed unclaimed, the task fails terminally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<DateTime<Utc>>,
    /// Claim attempts so far (incremented on every claim).
    pub attempts: u32,
    /// Retry budget enforced by the reaper.
    pub max_attempts: u32,
    /// Worker holding the claim, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Opaque work description; never interpreted by the engine.
    pub payload: serde_json::Value,
    /// Terminal result payload, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Terminal failure reason (`deadline_exceeded`, `max_attempts_exceeded`,
    /// or worker-supplied).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Bumped by heartbeats/status updates while claimed or running.
    pub last_progress_at: DateTime<Utc>,
}

impl Task {
    /// Materialize a submitted task, applying engine defaults.
    pub fn from_request(req: NewTask, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        let deadline_at = req
            .deadline_seconds
            .map(|secs| now + chrono::Duration::seconds(secs));
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            scope: req.scope,
            target_role: req.target_role,
            required_capabilities: req.required_capabilities,
            priority: req.priority,
            deadline_at,
            attempts: 0,
            max_attempts: req.max_attempts.unwrap_or(default_max_attempts),
            claimed_by: None,
            payload: req.payload,
            result: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            last_progress_at: now,
        }
    }

    /// Whether the deadline has passed at `now`.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.is_some_and(|d| d <= now)
    }
}

/// A task submission from a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub scope: TaskScope,
    #[serde(default)]
    pub target_role: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    /// Relative deadline; `0` means already expired (useful for tests and
    /// "now or never" work).
    #[serde(default)]
    pub deadline_seconds: Option<i64>,
    /// Overrides the engine's default retry budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Terminal release reported by the claim holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRelease {
    pub worker_id: String,
    /// Must be `completed` or `failed`.
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Failure reason recorded when a task expires unclaimed.
pub const REASON_DEADLINE_EXCEEDED: &str = "deadline_exceeded";
/// Failure reason recorded when the retry budget is exhausted.
pub const REASON_MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";
