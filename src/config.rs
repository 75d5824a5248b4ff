use std::time::Duration;

use uuid::Uuid;

/// Tuning for the restart debounce/burst-control state machine.
///
/// The shape of the algorithm (burst detect -> cooldown -> debounce settle)
/// is guaranteed; the constants are tuning knobs, not protocol contracts.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Signals within this window count toward burst detection.
    pub burst_window: Duration,
    /// Number of in-window signals that trips the cooldown.
    pub burst_capacity: usize,
    /// How long restarts are suppressed once a burst is detected.
    pub cooldown: Duration,
    /// Quiet period required after cooldown before the held restart fires.
    pub debounce: Duration,
    /// Delay applied to an isolated signal before its restart fires.
    pub base_delay: Duration,
    /// Signals arriving closer together than this escalate the extra delay.
    pub min_spacing: Duration,
    /// Upper bound on the escalating extra delay.
    pub max_extra_delay: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            burst_window: Duration::from_millis(20),
            burst_capacity: 10,
            cooldown: Duration::from_secs(2),
            debounce: Duration::from_millis(100),
            base_delay: Duration::from_millis(10),
            min_spacing: Duration::from_millis(50),
            max_extra_delay: Duration::from_secs(1),
        }
    }
}

/// Configuration for one scheduler host instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lock-holder identity recorded on every lease this node claims.
    /// Must be unique per cooperating node instance.
    pub node_id: String,
    /// Maximum number of pooled workers executing concurrently.
    /// LongRunning work bypasses this bound.
    pub max_concurrency: usize,
    /// How long a pooled worker waits without work before self-terminating.
    pub idle_worker_timeout: Duration,
    /// A lease held longer than this without reaching a terminal status is
    /// considered orphaned and eligible for reclaim.
    pub liveness_timeout: Duration,
    /// Period of the orphan-reclaim sweep.
    pub sweep_interval: Duration,
    /// How long shutdown waits for in-flight work to drain.
    pub drain_timeout: Duration,
    /// Backoff applied after an unexpected loop error before retrying.
    pub error_backoff: Duration,
    /// A restart is only requested when the candidate time beats the armed
    /// time by more than this tolerance.
    pub restart_tolerance: Duration,
    /// Cap on any single armed sleep; stands in for "wait forever" when
    /// nothing is pending.
    pub max_sleep: Duration,
    pub throttle: ThrottleConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::new_v4()),
            max_concurrency: 8,
            idle_worker_timeout: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
            restart_tolerance: Duration::from_secs(1),
            max_sleep: Duration::from_secs(24 * 60 * 60),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
