//! Engine configuration loaded from environment variables.

use std::time::Duration;

use rollgate_core::scheduling::StageSequencing;
use rollgate_core::store::Lease;

/// Scheduler and dispatcher settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on task runs executing at once in this process.
    pub max_concurrent_task_runs: usize,
    pub dispatch_poll_interval: Duration,
    pub stage_sequencing: StageSequencing,
    /// How long shutdown waits for in-flight runs before abandoning them.
    pub drain_timeout: Duration,
    /// How often a running task checks for a cancel request.
    pub cancel_poll_interval: Duration,
    /// Owner recorded on every run this process claims. Must be unique
    /// among workers sharing a store.
    pub worker_id: String,
    /// A claimed run whose lease is not renewed within this window is
    /// considered abandoned and requeued.
    pub task_run_lease: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_task_runs: 8,
            dispatch_poll_interval: Duration::from_millis(1000),
            stage_sequencing: StageSequencing::Independent,
            drain_timeout: Duration::from_secs(30),
            cancel_poll_interval: Duration::from_millis(500),
            worker_id: default_worker_id(),
            task_run_lease: Duration::from_secs(30),
        }
    }
}

fn default_worker_id() -> String {
    format!(
        "worker-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    )
}

impl SchedulerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default       |
    /// |-----------------------------|---------------|
    /// | `MAX_CONCURRENT_TASK_RUNS`  | `8`           |
    /// | `DISPATCH_POLL_INTERVAL_MS` | `1000`        |
    /// | `STAGE_SEQUENCING`          | `independent` |
    /// | `DRAIN_TIMEOUT_SECS`        | `30`          |
    /// | `CANCEL_POLL_INTERVAL_MS`   | `500`         |
    /// | `WORKER_ID`                 | generated     |
    /// | `TASK_RUN_LEASE_SECS`       | `30`          |
    pub fn from_env() -> Self {
        let max_concurrent_task_runs: usize = std::env::var("MAX_CONCURRENT_TASK_RUNS")
            .unwrap_or_else(|_| "8".into())
            .parse()
            .expect("MAX_CONCURRENT_TASK_RUNS must be a valid usize");
        assert!(
            max_concurrent_task_runs > 0,
            "MAX_CONCURRENT_TASK_RUNS must be at least 1"
        );

        let dispatch_poll_interval_ms: u64 = std::env::var("DISPATCH_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .expect("DISPATCH_POLL_INTERVAL_MS must be a valid u64");

        let stage_sequencing: StageSequencing = std::env::var("STAGE_SEQUENCING")
            .unwrap_or_else(|_| "independent".into())
            .parse()
            .expect("STAGE_SEQUENCING must be 'independent' or 'sequential'");

        let drain_timeout_secs: u64 = std::env::var("DRAIN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("DRAIN_TIMEOUT_SECS must be a valid u64");

        let cancel_poll_interval_ms: u64 = std::env::var("CANCEL_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "500".into())
            .parse()
            .expect("CANCEL_POLL_INTERVAL_MS must be a valid u64");

        let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id());

        let task_run_lease_secs: u64 = std::env::var("TASK_RUN_LEASE_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("TASK_RUN_LEASE_SECS must be a valid u64");
        assert!(task_run_lease_secs > 0, "TASK_RUN_LEASE_SECS must be at least 1");

        Self {
            max_concurrent_task_runs,
            dispatch_poll_interval: Duration::from_millis(dispatch_poll_interval_ms),
            stage_sequencing,
            drain_timeout: Duration::from_secs(drain_timeout_secs),
            cancel_poll_interval: Duration::from_millis(cancel_poll_interval_ms),
            worker_id,
            task_run_lease: Duration::from_secs(task_run_lease_secs),
        }
    }

    pub fn lease(&self) -> Lease {
        Lease::new(self.worker_id.clone(), self.task_run_lease)
    }
}

/// Approval runner settings.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub poll_interval: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl ApprovalConfig {
    /// | Env Var                     | Default |
    /// |-----------------------------|---------|
    /// | `APPROVAL_POLL_INTERVAL_MS` | `1000`  |
    pub fn from_env() -> Self {
        let poll_interval_ms: u64 = std::env::var("APPROVAL_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .expect("APPROVAL_POLL_INTERVAL_MS must be a valid u64");

        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }
}
