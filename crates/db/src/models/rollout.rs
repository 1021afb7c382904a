//! Rows of `plans`, `rollouts`, `stages`, `tasks` and `task_runs`.

use rollgate_core::error::CoreError;
use rollgate_core::executor::QueryResult;
use rollgate_core::rollout::{ChangeKind, Plan, Spec, Stage, Task, TaskRun};
use rollgate_core::status::{StatusId, TaskRunStatus, TaskStatus};
use rollgate_core::types::{DbId, Timestamp};
use sqlx::types::Json;
use sqlx::FromRow;

use super::corrupt;

#[derive(Debug, Clone, FromRow)]
pub struct PlanRow {
    pub id: DbId,
    pub project_id: String,
    pub title: String,
    pub specs: Json<Vec<Spec>>,
    pub creator: String,
    pub created_at: Timestamp,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            project_id: row.project_id,
            title: row.title,
            specs: row.specs.0,
            creator: row.creator,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RolloutRow {
    pub id: DbId,
    pub project_id: String,
    pub plan_id: DbId,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct StageRow {
    pub id: DbId,
    pub rollout_id: DbId,
    pub environment_id: String,
    pub position: i32,
}

impl StageRow {
    /// Attach the stage's tasks, already in stage order.
    pub fn with_tasks(self, tasks: Vec<Task>) -> Stage {
        Stage {
            id: self.id,
            rollout_id: self.rollout_id,
            environment_id: self.environment_id,
            position: self.position,
            tasks,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: DbId,
    pub rollout_id: DbId,
    pub stage_id: DbId,
    pub spec_id: String,
    pub kind: String,
    pub instance_id: String,
    pub database_name: String,
    pub environment_id: String,
    pub sql: String,
    pub status_id: StatusId,
    pub skipped_reason: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let kind: ChangeKind = row
            .kind
            .parse()
            .map_err(|_| corrupt("tasks", "kind", &row.kind))?;
        let status =
            TaskStatus::from_id(row.status_id).ok_or_else(|| corrupt("tasks", "status_id", row.status_id))?;
        Ok(Task {
            id: row.id,
            rollout_id: row.rollout_id,
            stage_id: row.stage_id,
            spec_id: row.spec_id,
            kind,
            instance_id: row.instance_id,
            database_name: row.database_name,
            environment_id: row.environment_id,
            sql: row.sql,
            status,
            skipped_reason: row.skipped_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRunRow {
    pub id: DbId,
    pub task_id: DbId,
    pub attempt: i32,
    pub status_id: StatusId,
    pub creator: String,
    pub results: Json<Vec<QueryResult>>,
    pub detail: String,
    pub cancel_requested: bool,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl TryFrom<TaskRunRow> for TaskRun {
    type Error = CoreError;

    fn try_from(row: TaskRunRow) -> Result<Self, Self::Error> {
        let status = TaskRunStatus::from_id(row.status_id)
            .ok_or_else(|| corrupt("task_runs", "status_id", row.status_id))?;
        Ok(TaskRun {
            id: row.id,
            task_id: row.task_id,
            attempt: row.attempt,
            status,
            creator: row.creator,
            results: row.results.0,
            detail: row.detail,
            cancel_requested: row.cancel_requested,
            worker_id: row.worker_id,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

/// Outcome of [`crate::repositories::TaskRunRepo::claim_for_task`].
#[derive(Debug, Clone)]
pub enum TaskClaim {
    /// The task moved to `PENDING` and this run was inserted.
    Created(TaskRunRow),
    /// The task exists but was not in an allowed status.
    Refused(StatusId),
    Missing,
}

/// Outcome of [`crate::repositories::TaskRunRepo::request_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// A pending run was canceled together with its task.
    Canceled,
    /// A running run was flagged; the runner stops between statements.
    Requested,
    /// The run had already finished with this status.
    Terminal(StatusId),
    Missing,
}
