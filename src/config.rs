//! Configuration types.

use std::time::Duration;

/// Engine configuration.
///
/// The reaper/deadline constants are operator-tunable; see `from_env`.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Engine name for identification.
    pub name: String,
    /// Running tasks with no progress update for this long are requeued.
    pub stuck_timeout: Duration,
    /// How often the reaper sweeps for stuck/expired tasks.
    pub reaper_interval: Duration,
    /// Workers silent longer than this are excluded from routing.
    pub liveness_ttl: Duration,
    /// Default retry budget for tasks that don't specify one.
    pub default_max_attempts: u32,
    /// How many claimable candidates a single claim poll scans.
    pub claim_batch: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            name: "agent-dispatch".to_string(),
            stuck_timeout: Duration::from_secs(300), // 5 minutes
            reaper_interval: Duration::from_secs(30),
            liveness_ttl: Duration::from_secs(90),
            default_max_attempts: 3,
            claim_batch: 32,
        }
    }
}

impl DispatchConfig {
    /// Build a config from `DISPATCH_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: defaults.name,
            stuck_timeout: env_secs("DISPATCH_STUCK_TIMEOUT_SECS", defaults.stuck_timeout),
            reaper_interval: env_secs("DISPATCH_REAPER_INTERVAL_SECS", defaults.reaper_interval),
            liveness_ttl: env_secs("DISPATCH_LIVENESS_TTL_SECS", defaults.liveness_ttl),
            default_max_attempts: std::env::var("DISPATCH_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_max_attempts),
            claim_batch: defaults.claim_batch,
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
