use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Cadence and sizing knobs for the sync loops. The defaults match the
/// behavior the engine was tuned for; deployments mostly leave them alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Long-poll waits are time-bounded by convention and must be restarted.
    pub idle_restart_interval: Duration,
    /// Delay before retrying after a failed wait.
    pub idle_retry_delay: Duration,
    /// How often the backfill producer scans for body-less messages.
    pub backfill_scan_interval: Duration,
    /// In-flight identifiers the backfill queue holds; offers beyond this
    /// are dropped until the next scan.
    pub backfill_queue_capacity: usize,
    /// Rows per missing-body scan.
    pub backfill_batch_limit: i64,
    /// Pause between consecutive body fetches.
    pub backfill_fetch_delay: Duration,
    /// How often the reconciler walks the non-watched folders.
    pub reconcile_interval: Duration,
    /// Bound on joins during shutdown before a loop is detached.
    pub shutdown_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            idle_restart_interval: Duration::from_secs(20 * 60),
            idle_retry_delay: Duration::from_secs(5),
            backfill_scan_interval: Duration::from_secs(20),
            backfill_queue_capacity: 1,
            backfill_batch_limit: 50,
            backfill_fetch_delay: Duration::from_millis(100),
            reconcile_interval: Duration::from_secs(20),
            shutdown_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}
