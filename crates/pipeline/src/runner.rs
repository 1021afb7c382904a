//! Executes one claimed task run.
//!
//! Statements run stop-on-error on a single connection. A watcher renews the
//! run's lease and polls the store for cancel requests, tripping the
//! executor's token (checked between statements) on a cancel or when the
//! lease has passed to another worker.

use std::sync::Arc;
use std::time::Duration;

use rollgate_core::catalog::{CreateDatabase, Instance};
use rollgate_core::error::{CoreError, CoreResult};
use rollgate_core::executor::{execute_script, ExecuteOptions, QueryResult};
use rollgate_core::rollout::{ChangeKind, Task, TaskRun};
use rollgate_core::status::TaskRunStatus;
use rollgate_core::store::{Lease, Store};
use rollgate_core::types::DbId;
use rollgate_events::bus::{TASK_RUN_FINISHED, TASK_RUN_STARTED};
use rollgate_events::{EventBus, PlatformEvent};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::connection::ConnectionProvider;

/// How a run ended, before it is written back.
#[derive(Debug)]
struct RunOutcome {
    status: TaskRunStatus,
    results: Vec<QueryResult>,
    detail: String,
}

impl RunOutcome {
    fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: TaskRunStatus::Failed,
            results: Vec::new(),
            detail: detail.into(),
        }
    }
}

pub struct TaskRunner {
    store: Arc<dyn Store>,
    connections: Arc<dyn ConnectionProvider>,
    event_bus: Arc<EventBus>,
    lease: Lease,
    cancel_poll_interval: Duration,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn Store>,
        connections: Arc<dyn ConnectionProvider>,
        event_bus: Arc<EventBus>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            connections,
            event_bus,
            lease: config.lease(),
            cancel_poll_interval: config.cancel_poll_interval,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Execute a run this worker claimed as `Running` and record its
    /// outcome. `Conflict` if the lease was lost while executing; the outcome
    /// is then dropped and the new holder runs the task.
    pub async fn run(&self, run: TaskRun, task: Task) -> CoreResult<TaskRun> {
        tracing::info!(
            task_run_id = run.id,
            task_id = task.id,
            instance_id = %task.instance_id,
            database = %task.database_name,
            "Task run started",
        );
        self.event_bus.publish(
            PlatformEvent::new(TASK_RUN_STARTED)
                .with_source("task_run", run.id)
                .with_payload(serde_json::json!({ "task_id": task.id, "attempt": run.attempt })),
        );

        let cancel = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let watcher = tokio::spawn(watch_run(
            self.store.clone(),
            run.id,
            self.lease.clone(),
            cancel.clone(),
            lease_lost.clone(),
            self.cancel_poll_interval,
        ));

        let outcome = self.execute(run.id, &task, &cancel).await;
        watcher.abort();

        if lease_lost.is_cancelled() {
            tracing::warn!(
                task_run_id = run.id,
                worker_id = %self.lease.worker_id,
                "Task run lease lost, outcome discarded",
            );
            return Err(CoreError::Conflict(format!(
                "task run {} lease lost by worker {}",
                run.id, self.lease.worker_id
            )));
        }

        let finished = self
            .store
            .finish_task_run(
                run.id,
                &self.lease.worker_id,
                outcome.status,
                &outcome.results,
                &outcome.detail,
            )
            .await?;

        match finished.status {
            TaskRunStatus::Failed => tracing::warn!(
                task_run_id = run.id,
                task_id = task.id,
                detail = %finished.detail,
                "Task run failed",
            ),
            status => tracing::info!(
                task_run_id = run.id,
                task_id = task.id,
                status = %status,
                statements = finished.results.len(),
                "Task run finished",
            ),
        }
        self.event_bus.publish(
            PlatformEvent::new(TASK_RUN_FINISHED)
                .with_source("task_run", run.id)
                .with_payload(serde_json::json!({
                    "task_id": task.id,
                    "status": finished.status,
                    "detail": finished.detail,
                })),
        );
        Ok(finished)
    }

    async fn execute(&self, task_run_id: DbId, task: &Task, cancel: &CancellationToken) -> RunOutcome {
        match self.store.is_cancel_requested(task_run_id).await {
            Ok(true) => {
                return RunOutcome {
                    status: TaskRunStatus::Canceled,
                    results: Vec::new(),
                    detail: "canceled before start".into(),
                }
            }
            Ok(false) => {}
            Err(e) => return RunOutcome::failed(e.to_string()),
        }

        let instance = match self.store.get_instance(&task.instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return RunOutcome::failed(format!("instance {} not found", task.instance_id)),
            Err(e) => return RunOutcome::failed(e.to_string()),
        };

        match task.kind {
            ChangeKind::DatabaseCreate => self.create_database(task, &instance, cancel).await,
            ChangeKind::SchemaMigration | ChangeKind::DataChange => {
                self.run_script(&instance, Some(&task.database_name), &task.sql, cancel)
                    .await
            }
        }
    }

    async fn run_script(
        &self,
        instance: &Instance,
        database: Option<&str>,
        script: &str,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut conn = match self.connections.connect(instance, database).await {
            Ok(conn) => conn,
            Err(e) => return RunOutcome::failed(e.to_string()),
        };

        let exec = execute_script(conn.as_mut(), script, &ExecuteOptions::stop_on_error(), cancel).await;

        if let Some(failure) = exec.error {
            RunOutcome {
                status: TaskRunStatus::Failed,
                results: exec.results,
                detail: failure.to_string(),
            }
        } else if exec.canceled {
            RunOutcome {
                status: TaskRunStatus::Canceled,
                results: exec.results,
                detail: "canceled".into(),
            }
        } else {
            RunOutcome {
                status: TaskRunStatus::Done,
                results: exec.results,
                detail: String::new(),
            }
        }
    }

    /// `CREATE DATABASE` on the instance, then register it in the catalog.
    async fn create_database(&self, task: &Task, instance: &Instance, cancel: &CancellationToken) -> RunOutcome {
        let statement = format!("CREATE DATABASE \"{}\";", task.database_name.replace('"', "\"\""));
        let outcome = self.run_script(instance, None, &statement, cancel).await;
        if outcome.status != TaskRunStatus::Done {
            return outcome;
        }

        let project_id = match self.store.get_rollout(task.rollout_id).await {
            Ok(Some(rollout)) => rollout.project_id,
            Ok(None) => return RunOutcome::failed(format!("rollout {} not found", task.rollout_id)),
            Err(e) => return RunOutcome::failed(e.to_string()),
        };
        let input = CreateDatabase {
            name: task.database_name.clone(),
            project_id,
            environment_id: Some(task.environment_id.clone()),
        };
        match self.store.create_database(&instance.id, &input).await {
            Ok(_) | Err(CoreError::Conflict(_)) => outcome,
            Err(e) => RunOutcome {
                detail: format!("database created but not registered: {e}"),
                status: TaskRunStatus::Failed,
                ..outcome
            },
        }
    }
}

/// Renewals happen three times per lease window.
fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(10))
}

/// Keep the lease alive until aborted. Trips `cancel` once the run's cancel
/// flag is set, and both tokens once the lease is gone.
async fn watch_run(
    store: Arc<dyn Store>,
    task_run_id: DbId,
    lease: Lease,
    cancel: CancellationToken,
    lease_lost: CancellationToken,
    poll_every: Duration,
) {
    let mut poll = tokio::time::interval(poll_every);
    let mut renew = tokio::time::interval(renew_interval(lease.ttl));
    loop {
        tokio::select! {
            _ = renew.tick() => match store.renew_task_run_lease(task_run_id, &lease).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(task_run_id, worker_id = %lease.worker_id, "Task run lease lost, stopping");
                    lease_lost.cancel();
                    cancel.cancel();
                    break;
                }
                Err(e) => tracing::warn!(task_run_id, error = %e, "Lease renewal failed"),
            },
            _ = poll.tick(), if !cancel.is_cancelled() => match store.is_cancel_requested(task_run_id).await {
                Ok(true) => {
                    tracing::info!(task_run_id, "Cancel requested, stopping after current statement");
                    cancel.cancel();
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(task_run_id, error = %e, "Cancel check failed"),
            },
        }
    }
}
