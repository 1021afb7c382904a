//! Task run scheduling.
//!
//! Every run is created through [`RolloutStore::claim_task_run`], which
//! moves the task to `Pending` atomically. Whoever loses that race sees the
//! outstanding run and reports success; duplicate triggers are never errors.
//!
//! [`RolloutStore::claim_task_run`]: rollgate_core::store::RolloutStore::claim_task_run

use std::sync::Arc;

use rollgate_core::error::{CoreError, CoreResult};
use rollgate_core::rollout::{Stage, TaskRun};
use rollgate_core::scheduling::{is_stage_complete_status, state_machine, StageSequencing};
use rollgate_core::status::{TaskRunStatus, TaskStatus};
use rollgate_core::store::{CancelOutcome, RunClaim, Store};
use rollgate_core::types::DbId;
use rollgate_events::bus::{TASK_RUN_CREATED, TASK_RUN_FINISHED};
use rollgate_events::{EventBus, PlatformEvent};
use serde::Serialize;

/// What a trigger or re-run did for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerOutcome {
    /// A new run was created by this request.
    Created { task_run: TaskRun },
    /// The task already had an outstanding run; nothing was created.
    AlreadyActive { status: TaskStatus },
    /// The task's status does not allow this request; nothing was created.
    Unchanged { status: TaskStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskTrigger {
    pub task_id: DbId,
    #[serde(flatten)]
    pub outcome: TriggerOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSkip {
    pub task_id: DbId,
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRunCancel {
    pub task_run_id: DbId,
    pub outcome: CancelOutcome,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    event_bus: Arc<EventBus>,
    sequencing: StageSequencing,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, event_bus: Arc<EventBus>, sequencing: StageSequencing) -> Self {
        Self {
            store,
            event_bus,
            sequencing,
        }
    }

    pub fn sequencing(&self) -> StageSequencing {
        self.sequencing
    }

    // -----------------------------------------------------------------------
    // Run creation
    // -----------------------------------------------------------------------

    /// Batch run: start the first run of every named task that has not
    /// started. Safe to repeat and to call concurrently.
    pub async fn trigger_run(&self, stage_id: DbId, task_ids: &[DbId], creator: &str) -> CoreResult<Vec<TaskTrigger>> {
        self.start_runs(stage_id, task_ids, state_machine::trigger_sources(), creator)
            .await
    }

    /// Explicit re-run of tasks in a terminal status. Each creates a new run.
    pub async fn rerun(&self, stage_id: DbId, task_ids: &[DbId], creator: &str) -> CoreResult<Vec<TaskTrigger>> {
        self.start_runs(stage_id, task_ids, state_machine::rerun_sources(), creator)
            .await
    }

    async fn start_runs(
        &self,
        stage_id: DbId,
        task_ids: &[DbId],
        allowed_from: &[TaskStatus],
        creator: &str,
    ) -> CoreResult<Vec<TaskTrigger>> {
        let stage = self.stage_with_tasks(stage_id, task_ids).await?;
        self.check_sequencing(&stage).await?;

        let mut out = Vec::with_capacity(task_ids.len());
        for &task_id in &dedup(task_ids) {
            let outcome = match self.store.claim_task_run(task_id, allowed_from, creator).await? {
                RunClaim::Created(run) => {
                    tracing::info!(
                        stage_id,
                        task_id,
                        task_run_id = run.id,
                        attempt = run.attempt,
                        creator,
                        "Task run created",
                    );
                    self.event_bus.publish(
                        PlatformEvent::new(TASK_RUN_CREATED)
                            .with_source("task_run", run.id)
                            .with_actor(creator)
                            .with_payload(serde_json::json!({
                                "task_id": task_id,
                                "stage_id": stage_id,
                                "attempt": run.attempt,
                            })),
                    );
                    TriggerOutcome::Created { task_run: run }
                }
                RunClaim::Active(status) => {
                    tracing::debug!(task_id, status = %status, "Duplicate run request ignored");
                    TriggerOutcome::AlreadyActive { status }
                }
                RunClaim::Ineligible(status) => {
                    tracing::debug!(task_id, status = %status, "Task not eligible for run request");
                    TriggerOutcome::Unchanged { status }
                }
            };
            out.push(TaskTrigger { task_id, outcome });
        }
        Ok(out)
    }

    /// Under sequential sequencing every task of every earlier stage must be
    /// finished.
    async fn check_sequencing(&self, stage: &Stage) -> CoreResult<()> {
        if self.sequencing == StageSequencing::Independent {
            return Ok(());
        }
        let rollout = self
            .store
            .get_rollout(stage.rollout_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Rollout", stage.rollout_id))?;

        let blocking = rollout
            .stages
            .iter()
            .filter(|s| s.position < stage.position)
            .flat_map(|s| s.tasks.iter().map(move |t| (s, t)))
            .find(|(_, t)| !is_stage_complete_status(t.status));

        match blocking {
            Some((earlier, task)) => Err(CoreError::FailedPrecondition(format!(
                "stage {} cannot start before stage {} finishes (task {} is {})",
                stage.id, earlier.id, task.id, task.status
            ))),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Skip / cancel
    // -----------------------------------------------------------------------

    /// Skip tasks that have not started or are still pending.
    pub async fn skip(&self, stage_id: DbId, task_ids: &[DbId], reason: &str) -> CoreResult<Vec<TaskSkip>> {
        self.stage_with_tasks(stage_id, task_ids).await?;

        let mut out = Vec::with_capacity(task_ids.len());
        for &task_id in &dedup(task_ids) {
            let skipped = self.store.skip_task(task_id, reason).await?;
            if skipped {
                tracing::info!(stage_id, task_id, reason, "Task skipped");
            } else {
                tracing::debug!(stage_id, task_id, "Task not skippable in its current status");
            }
            out.push(TaskSkip { task_id, skipped });
        }
        Ok(out)
    }

    /// Cancel runs of tasks in `stage_id`. Pending runs are canceled at once;
    /// running ones stop before their next statement.
    pub async fn cancel(&self, stage_id: DbId, task_run_ids: &[DbId]) -> CoreResult<Vec<TaskRunCancel>> {
        if task_run_ids.is_empty() {
            return Err(CoreError::Validation("no task runs to cancel".into()));
        }
        let stage = self.get_stage(stage_id).await?;

        let mut runs = Vec::with_capacity(task_run_ids.len());
        for &task_run_id in &dedup(task_run_ids) {
            let run = self
                .store
                .get_task_run(task_run_id)
                .await?
                .ok_or_else(|| CoreError::not_found("TaskRun", task_run_id))?;
            if !stage.tasks.iter().any(|t| t.id == run.task_id) {
                return Err(CoreError::Validation(format!(
                    "task run {task_run_id} does not belong to stage {stage_id}"
                )));
            }
            runs.push(run);
        }

        let mut out = Vec::with_capacity(runs.len());
        for run in runs {
            let outcome = self.store.request_cancel(run.id).await?;
            tracing::info!(task_run_id = run.id, task_id = run.task_id, outcome = ?outcome, "Task run cancel requested");
            if outcome == CancelOutcome::Canceled {
                self.event_bus.publish(
                    PlatformEvent::new(TASK_RUN_FINISHED)
                        .with_source("task_run", run.id)
                        .with_payload(serde_json::json!({
                            "task_id": run.task_id,
                            "status": TaskRunStatus::Canceled,
                        })),
                );
            }
            out.push(TaskRunCancel {
                task_run_id: run.id,
                outcome,
            });
        }
        Ok(out)
    }

    /// All runs of a task, oldest first.
    pub async fn list_task_runs(&self, task_id: DbId) -> CoreResult<Vec<TaskRun>> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Task", task_id))?;
        self.store.list_task_runs(task_id).await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn get_stage(&self, stage_id: DbId) -> CoreResult<Stage> {
        self.store
            .get_stage(stage_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Stage", stage_id))
    }

    /// Load the stage and check every task belongs to it.
    async fn stage_with_tasks(&self, stage_id: DbId, task_ids: &[DbId]) -> CoreResult<Stage> {
        if task_ids.is_empty() {
            return Err(CoreError::Validation("no tasks specified".into()));
        }
        let stage = self.get_stage(stage_id).await?;
        if let Some(stray) = task_ids.iter().find(|id| !stage.tasks.iter().any(|t| t.id == **id)) {
            return Err(CoreError::Validation(format!(
                "task {stray} does not belong to stage {stage_id}"
            )));
        }
        Ok(stage)
    }
}

/// Drop repeated ids, keeping first occurrences in order.
fn dedup(ids: &[DbId]) -> Vec<DbId> {
    let mut seen = std::collections::HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Planner;
    use crate::testing;
    use assert_matches::assert_matches;
    use rollgate_core::rollout::Rollout;
    use rollgate_core::store::{MemoryStore, RolloutStore};

    async fn setup(sequencing: StageSequencing) -> (Arc<MemoryStore>, Scheduler, Rollout) {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        let plan = testing::create_plan(store.as_ref(), "CREATE TABLE t (id int);").await;
        let rollout = Planner::new(store.clone()).create_rollout(plan.id).await.unwrap();
        let scheduler = Scheduler::new(store.clone(), Arc::new(EventBus::default()), sequencing);
        (store, scheduler, rollout)
    }

    fn task_ids(rollout: &Rollout, stage: usize) -> Vec<DbId> {
        rollout.stages[stage].tasks.iter().map(|t| t.id).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_create_exactly_one_run() {
        let (store, scheduler, rollout) = setup(StageSequencing::Independent).await;
        let scheduler = Arc::new(scheduler);
        let stage = &rollout.stages[0];
        let task_id = stage.tasks[0].id;

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let scheduler = scheduler.clone();
                let stage_id = stage.id;
                tokio::spawn(async move { scheduler.trigger_run(stage_id, &[task_id], &format!("user{i}")).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            let result = handle.await.unwrap().expect("every trigger succeeds");
            if matches!(result[0].outcome, TriggerOutcome::Created { .. }) {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.list_task_runs(task_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_trigger_is_idempotent() {
        let (store, scheduler, rollout) = setup(StageSequencing::Independent).await;
        let stage_id = rollout.stages[1].id;
        let ids = task_ids(&rollout, 1);

        let first = scheduler.trigger_run(stage_id, &ids, "alice").await.unwrap();
        assert!(first.iter().all(|t| matches!(t.outcome, TriggerOutcome::Created { .. })));

        let second = scheduler.trigger_run(stage_id, &ids, "alice").await.unwrap();
        assert!(second.iter().all(|t| matches!(
            t.outcome,
            TriggerOutcome::AlreadyActive { status: TaskStatus::Pending }
        )));
        for id in ids {
            assert_eq!(store.list_task_runs(id).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn trigger_after_completion_does_not_create_a_run() {
        let (store, scheduler, rollout) = setup(StageSequencing::Independent).await;
        let stage_id = rollout.stages[0].id;
        let task_id = rollout.stages[0].tasks[0].id;

        scheduler.trigger_run(stage_id, &[task_id], "alice").await.unwrap();
        let (run, _) = store.claim_pending_task_run(&testing::scheduler_config().lease()).await.unwrap().unwrap();
        store.finish_task_run(run.id, testing::WORKER, TaskRunStatus::Done, &[], "").await.unwrap();

        let again = scheduler.trigger_run(stage_id, &[task_id], "alice").await.unwrap();
        assert_matches!(again[0].outcome, TriggerOutcome::Unchanged { status: TaskStatus::Done });
        assert_eq!(store.list_task_runs(task_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rerun_of_failed_task_creates_second_attempt() {
        let (store, scheduler, rollout) = setup(StageSequencing::Independent).await;
        let stage_id = rollout.stages[0].id;
        let task_id = rollout.stages[0].tasks[0].id;

        // Re-run is refused before the task has ever run.
        let early = scheduler.rerun(stage_id, &[task_id], "alice").await.unwrap();
        assert_matches!(early[0].outcome, TriggerOutcome::Unchanged { status: TaskStatus::NotStarted });

        scheduler.trigger_run(stage_id, &[task_id], "alice").await.unwrap();
        let (run, _) = store.claim_pending_task_run(&testing::scheduler_config().lease()).await.unwrap().unwrap();
        store
            .finish_task_run(run.id, testing::WORKER, TaskRunStatus::Failed, &[], "statement 0 failed")
            .await
            .unwrap();

        let rerun = scheduler.rerun(stage_id, &[task_id], "bob").await.unwrap();
        assert_matches!(&rerun[0].outcome, TriggerOutcome::Created { task_run } if task_run.attempt == 2);

        let runs = scheduler.list_task_runs(task_id).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(runs[0].status, TaskRunStatus::Failed);
    }

    #[tokio::test]
    async fn empty_and_foreign_task_lists_are_rejected() {
        let (_store, scheduler, rollout) = setup(StageSequencing::Independent).await;
        let stage_id = rollout.stages[0].id;
        let foreign = rollout.stages[1].tasks[0].id;

        assert_matches!(scheduler.trigger_run(stage_id, &[], "a").await, Err(CoreError::Validation(_)));
        assert_matches!(
            scheduler.trigger_run(stage_id, &[foreign], "a").await,
            Err(CoreError::Validation(msg)) if msg.contains("does not belong")
        );
        assert_matches!(
            scheduler.trigger_run(9999, &[foreign], "a").await,
            Err(CoreError::NotFound { entity: "Stage", .. })
        );
    }

    #[tokio::test]
    async fn sequential_sequencing_blocks_later_stage() {
        let (store, scheduler, rollout) = setup(StageSequencing::Sequential).await;
        let prod = &rollout.stages[1];
        let test_task = rollout.stages[0].tasks[0].id;

        assert_matches!(
            scheduler.trigger_run(prod.id, &task_ids(&rollout, 1), "a").await,
            Err(CoreError::FailedPrecondition(_))
        );

        // Skipping the only earlier task unblocks the stage.
        store.skip_task(test_task, "not needed").await.unwrap();
        let result = scheduler.trigger_run(prod.id, &task_ids(&rollout, 1), "a").await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn skip_only_applies_before_running() {
        let (store, scheduler, rollout) = setup(StageSequencing::Independent).await;
        let stage_id = rollout.stages[1].id;
        let ids = task_ids(&rollout, 1);

        scheduler.trigger_run(stage_id, &ids[..1], "a").await.unwrap();
        store.claim_pending_task_run(&testing::scheduler_config().lease()).await.unwrap().unwrap();

        let skipped = scheduler.skip(stage_id, &ids, "out of window").await.unwrap();
        assert_eq!(
            skipped,
            vec![
                TaskSkip { task_id: ids[0], skipped: false },
                TaskSkip { task_id: ids[1], skipped: true },
            ]
        );
    }

    #[tokio::test]
    async fn cancel_pending_run_publishes_finished_event() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        let plan = testing::create_plan(store.as_ref(), "SELECT 1;").await;
        let rollout = Planner::new(store.clone()).create_rollout(plan.id).await.unwrap();
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let scheduler = Scheduler::new(store.clone(), bus, StageSequencing::Independent);

        let stage = &rollout.stages[0];
        let triggered = scheduler.trigger_run(stage.id, &[stage.tasks[0].id], "a").await.unwrap();
        let TriggerOutcome::Created { task_run } = &triggered[0].outcome else {
            panic!("expected a new run");
        };

        let canceled = scheduler.cancel(stage.id, &[task_run.id]).await.unwrap();
        assert_eq!(canceled[0].outcome, CancelOutcome::Canceled);
        assert_eq!(store.get_task(stage.tasks[0].id).await.unwrap().unwrap().status, TaskStatus::Canceled);

        assert_eq!(events.recv().await.unwrap().event_type, TASK_RUN_CREATED);
        assert_eq!(events.recv().await.unwrap().event_type, TASK_RUN_FINISHED);
    }
}
