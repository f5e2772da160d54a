//! Routing engine — pure task/worker eligibility decision.
//!
//! Used advisorily by the notification fan-out (who to nudge) and
//! authoritatively inside the claim path (who may win). The two evaluations
//! may disagree transiently, e.g. when a worker drops a codebase between
//! notify and claim; the claim-time evaluation wins.

use chrono::{DateTime, Utc};

use crate::registry::model::WorkerRecord;
use crate::tasks::model::{Task, TaskScope};

/// Decide whether `worker` may take `task` at `now`.
///
/// All checks must pass: deadline not exceeded, target role exact match (if
/// set), scope match, capability superset.
pub fn eligible(task: &Task, worker: &WorkerRecord, now: DateTime<Utc>) -> bool {
    if task.deadline_passed(now) {
        return false;
    }

    if let Some(target) = &task.target_role {
        if worker.role != *target {
            return false;
        }
    }

    let scope_ok = match &task.scope {
        TaskScope::Global | TaskScope::PendingRegistration => true,
        TaskScope::Codebase(id) => worker.owned_codebases.iter().any(|c| c == id),
    };
    if !scope_ok {
        return false;
    }

    task.required_capabilities
        .iter()
        .all(|cap| worker.capabilities.iter().any(|have| have == cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::{NewTask, TaskScope};

    fn task(scope: TaskScope) -> Task {
        Task::from_request(
            NewTask {
                scope,
                target_role: None,
                required_capabilities: vec![],
                priority: 0,
                deadline_seconds: None,
                max_attempts: None,
                payload: serde_json::Value::Null,
            },
            3,
        )
    }

    fn worker(codebases: &[&str], capabilities: &[&str]) -> WorkerRecord {
        let now = Utc::now();
        WorkerRecord {
            worker_id: "w1".into(),
            role: "builder".into(),
            owned_codebases: codebases.iter().map(|s| s.to_string()).collect(),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            last_heartbeat_at: now,
            registered_at: now,
        }
    }

    #[test]
    fn global_scope_matches_any_worker() {
        assert!(eligible(&task(TaskScope::Global), &worker(&[], &[]), Utc::now()));
    }

    #[test]
    fn pending_registration_matches_unconfigured_worker() {
        let t = task(TaskScope::PendingRegistration);
        assert!(eligible(&t, &worker(&[], &[]), Utc::now()));
    }

    #[test]
    fn codebase_scope_requires_registration() {
        let t = task(TaskScope::Codebase("repo1".into()));
        assert!(eligible(&t, &worker(&["repo1"], &[]), Utc::now()));
        assert!(!eligible(&t, &worker(&["repo2"], &[]), Utc::now()));
        // Empty set is never implicitly "all"
        assert!(!eligible(&t, &worker(&[], &[]), Utc::now()));
    }

    #[test]
    fn target_role_must_match_exactly() {
        let mut t = task(TaskScope::Global);
        t.target_role = Some("builder".into());
        assert!(eligible(&t, &worker(&[], &[]), Utc::now()));

        t.target_role = Some("reviewer".into());
        assert!(!eligible(&t, &worker(&[], &[]), Utc::now()));
    }

    #[test]
    fn target_role_does_not_bypass_scope() {
        let mut t = task(TaskScope::Codebase("repo1".into()));
        t.target_role = Some("builder".into());
        assert!(!eligible(&t, &worker(&[], &[]), Utc::now()));
        assert!(eligible(&t, &worker(&["repo1"], &[]), Utc::now()));
    }

    #[test]
    fn capabilities_must_be_superset() {
        let mut t = task(TaskScope::Global);
        t.required_capabilities = vec!["git".into(), "docker".into()];

        assert!(eligible(&t, &worker(&[], &["git", "docker", "rust"]), Utc::now()));
        assert!(!eligible(&t, &worker(&[], &["git"]), Utc::now()));
        assert!(!eligible(&t, &worker(&[], &[]), Utc::now()));
    }

    #[test]
    fn passed_deadline_is_never_eligible() {
        let mut t = task(TaskScope::Global);
        t.deadline_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!eligible(&t, &worker(&[], &[]), Utc::now()));
    }
}
