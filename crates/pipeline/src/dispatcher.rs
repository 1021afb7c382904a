//! Background task run dispatcher.
//!
//! Polls every `dispatch_poll_interval` for pending runs and hands them to a
//! [`TaskRunner`]. Claims go through
//! [`RolloutStore::claim_pending_task_run`] under this worker's lease, so any
//! number of dispatchers in any number of processes can share one store
//! without double execution. Once per lease window the dispatcher also
//! requeues runs whose holder stopped renewing.
//!
//! [`RolloutStore::claim_pending_task_run`]: rollgate_core::store::RolloutStore::claim_pending_task_run

use std::sync::Arc;

use rollgate_core::error::CoreResult;
use rollgate_core::store::Store;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::runner::TaskRunner;

pub struct TaskRunDispatcher {
    store: Arc<dyn Store>,
    runner: Arc<TaskRunner>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl TaskRunDispatcher {
    pub fn new(store: Arc<dyn Store>, runner: Arc<TaskRunner>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_task_runs));
        Self {
            store,
            runner,
            config,
            permits,
            tracker: TaskTracker::new(),
        }
    }

    /// Run the dispatcher loop until the cancellation token is triggered,
    /// then wait up to `drain_timeout` for in-flight runs.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.dispatch_poll_interval);
        let mut sweep = tokio::time::interval(self.config.task_run_lease);
        tracing::info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.dispatch_poll_interval.as_millis() as u64,
            lease_secs = self.config.task_run_lease.as_secs(),
            max_concurrent = self.config.max_concurrent_task_runs,
            "Task run dispatcher started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Task run dispatcher shutting down");
                    break;
                }
                _ = sweep.tick() => self.requeue_expired().await,
                _ = ticker.tick() => {
                    if let Err(e) = self.try_dispatch().await {
                        tracing::error!(error = %e, "Dispatch cycle failed");
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Return runs abandoned by crashed or stalled workers to the queue.
    pub async fn requeue_expired(&self) {
        match self.store.requeue_expired_task_runs().await {
            Ok(0) => {}
            Ok(requeued) => tracing::info!(requeued, "Requeued task runs with expired leases"),
            Err(e) => tracing::error!(error = %e, "Failed to requeue expired task runs"),
        }
    }

    /// One dispatch cycle: claim runs while execution slots are free.
    /// Returns how many runs were started.
    pub async fn try_dispatch(&self) -> CoreResult<usize> {
        let mut started = 0;
        while let Ok(permit) = self.permits.clone().try_acquire_owned() {
            let Some((run, task)) = self.store.claim_pending_task_run(self.runner.lease()).await? else {
                break;
            };
            tracing::debug!(task_run_id = run.id, task_id = task.id, "Task run claimed");

            let runner = self.runner.clone();
            self.tracker.spawn(async move {
                let task_run_id = run.id;
                if let Err(e) = runner.run(run, task).await {
                    tracing::error!(task_run_id, error = %e, "Failed to record task run outcome");
                }
                drop(permit);
            });
            started += 1;
        }
        Ok(started)
    }

    async fn drain(&self) {
        self.tracker.close();
        if self.tracker.is_empty() {
            return;
        }
        tracing::info!(in_flight = self.tracker.len(), "Draining in-flight task runs");
        if tokio::time::timeout(self.config.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                abandoned = self.tracker.len(),
                "Drain timed out, runs stay RUNNING until their leases expire",
            );
        }
    }
}
