//! Background engine: the task run dispatcher and the approval runner.
//!
//! Runs inside the API process (`EMBEDDED_WORKER=true`) or as the
//! stand-alone `rollgate-worker` binary. Any number of workers may share one
//! PostgreSQL store; claims are atomic.

use std::sync::Arc;

use rollgate_core::advisor::StatementAdvisor;
use rollgate_core::store::Store;
use rollgate_events::EventBus;
use rollgate_pipeline::{
    ApprovalConfig, ApprovalRunner, ConnectionProvider, SchedulerConfig, TaskRunDispatcher, TaskRunner,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct Worker {
    dispatcher: TaskRunDispatcher,
    approvals: ApprovalRunner,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        connections: Arc<dyn ConnectionProvider>,
        advisor: Arc<dyn StatementAdvisor>,
        event_bus: Arc<EventBus>,
        scheduler: SchedulerConfig,
        approval: ApprovalConfig,
    ) -> Self {
        let runner = Arc::new(TaskRunner::new(store.clone(), connections, event_bus.clone(), &scheduler));
        Self {
            dispatcher: TaskRunDispatcher::new(store.clone(), runner, scheduler),
            approvals: ApprovalRunner::new(store, advisor, event_bus, approval),
        }
    }

    /// Wakes the approval runner ahead of its next tick.
    pub fn approval_waker(&self) -> Arc<Notify> {
        self.approvals.waker()
    }

    /// Run both loops until `cancel` fires. Returns once in-flight task runs
    /// have drained or the drain timeout elapsed.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Worker started");
        tokio::join!(self.dispatcher.run(cancel.clone()), self.approvals.run(cancel));
        tracing::info!("Worker stopped");
    }
}
