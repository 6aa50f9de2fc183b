//! Session tuning knobs.

use std::time::Duration;

/// Scheduling and cache-coordination settings for a session.
#[derive(Clone, Debug)]
pub struct Config {
    /// How many rule bodies may compute concurrently. Zero keeps the
    /// session a single-threaded cooperative driver; bodies parked in a
    /// demand do not count against the width.
    pub workers: usize,
    /// Initial delay before re-polling a foreign cache claim.
    pub claim_backoff: Duration,
    /// Upper bound for the exponential claim backoff.
    pub claim_backoff_cap: Duration,
    /// A claim whose heartbeat is older than this may be taken over.
    pub stale_claim: Duration,
    /// How often the driver refreshes heartbeats on claims it holds.
    pub heartbeat_interval: Duration,
    /// Optional per-task wall-clock budget, checked at suspension points.
    pub task_timeout: Option<Duration>,
    /// Warn at session close when created tasks never ran.
    pub warn_unexecuted: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 0,
            claim_backoff: Duration::from_millis(25),
            claim_backoff_cap: Duration::from_secs(1),
            stale_claim: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(15),
            task_timeout: None,
            warn_unexecuted: true,
        }
    }
}
