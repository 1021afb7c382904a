//! Repositories for `rollouts`, `stages` and `tasks`.

use rollgate_core::rollout::StageDraft;
use rollgate_core::scheduling::state_machine;
use rollgate_core::status::{StatusId, TaskRunStatus, TaskStatus};
use rollgate_core::types::DbId;
use sqlx::PgPool;

use crate::models::rollout::{RolloutRow, StageRow, TaskRow};

const ROLLOUT_COLUMNS: &str = "id, project_id, plan_id, created_at";

const STAGE_COLUMNS: &str = "id, rollout_id, environment_id, position";

pub(crate) const TASK_COLUMNS: &str = "id, rollout_id, stage_id, spec_id, kind, instance_id, \
    database_name, environment_id, sql, status_id, skipped_reason, created_at, updated_at";

pub struct RolloutRepo;

impl RolloutRepo {
    /// Insert a rollout with all its stages and tasks in one transaction.
    /// Fails with a `uq_rollouts_plan` violation if the plan already has one.
    pub async fn create(
        pool: &PgPool,
        project_id: &str,
        plan_id: DbId,
        stages: &[StageDraft],
    ) -> Result<DbId, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let rollout_id: DbId = sqlx::query_scalar(
            "INSERT INTO rollouts (project_id, plan_id) VALUES ($1, $2) RETURNING id",
        )
        .bind(project_id)
        .bind(plan_id)
        .fetch_one(&mut *tx)
        .await?;

        for stage in stages {
            let stage_id: DbId = sqlx::query_scalar(
                "INSERT INTO stages (rollout_id, environment_id, position)
                 VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(rollout_id)
            .bind(&stage.environment_id)
            .bind(stage.position)
            .fetch_one(&mut *tx)
            .await?;

            for task in &stage.tasks {
                sqlx::query(
                    "INSERT INTO tasks
                        (rollout_id, stage_id, spec_id, kind, instance_id, database_name,
                         environment_id, sql, status_id)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(rollout_id)
                .bind(stage_id)
                .bind(&task.spec_id)
                .bind(task.kind.as_str())
                .bind(&task.instance_id)
                .bind(&task.database_name)
                .bind(&task.environment_id)
                .bind(&task.sql)
                .bind(TaskStatus::NotStarted.id())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(rollout_id)
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<RolloutRow>, sqlx::Error> {
        let query = format!("SELECT {ROLLOUT_COLUMNS} FROM rollouts WHERE id = $1");
        sqlx::query_as::<_, RolloutRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_plan(pool: &PgPool, plan_id: DbId) -> Result<Option<RolloutRow>, sqlx::Error> {
        let query = format!("SELECT {ROLLOUT_COLUMNS} FROM rollouts WHERE plan_id = $1");
        sqlx::query_as::<_, RolloutRow>(&query)
            .bind(plan_id)
            .fetch_optional(pool)
            .await
    }

    /// Stages of a rollout in pipeline order.
    pub async fn list_stages(pool: &PgPool, rollout_id: DbId) -> Result<Vec<StageRow>, sqlx::Error> {
        let query = format!("SELECT {STAGE_COLUMNS} FROM stages WHERE rollout_id = $1 ORDER BY position");
        sqlx::query_as::<_, StageRow>(&query)
            .bind(rollout_id)
            .fetch_all(pool)
            .await
    }

    pub async fn find_stage(pool: &PgPool, stage_id: DbId) -> Result<Option<StageRow>, sqlx::Error> {
        let query = format!("SELECT {STAGE_COLUMNS} FROM stages WHERE id = $1");
        sqlx::query_as::<_, StageRow>(&query)
            .bind(stage_id)
            .fetch_optional(pool)
            .await
    }
}

pub struct TaskRepo;

impl TaskRepo {
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<TaskRow>, sqlx::Error> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Tasks of a rollout in insertion order, which is stage order.
    pub async fn list_for_rollout(pool: &PgPool, rollout_id: DbId) -> Result<Vec<TaskRow>, sqlx::Error> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE rollout_id = $1 ORDER BY id");
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(rollout_id)
            .fetch_all(pool)
            .await
    }

    pub async fn list_for_stage(pool: &PgPool, stage_id: DbId) -> Result<Vec<TaskRow>, sqlx::Error> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE stage_id = $1 ORDER BY id");
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(stage_id)
            .fetch_all(pool)
            .await
    }

    /// Skip a task that is `NOT_STARTED` or `PENDING`, canceling its pending
    /// run. Returns `None` if the task does not exist and `Some(false)` if it
    /// was in another status.
    pub async fn skip(pool: &PgPool, id: DbId, reason: &str) -> Result<Option<bool>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let from: Vec<StatusId> = state_machine::skip_sources().iter().map(|s| s.id()).collect();

        let skipped = sqlx::query(
            "UPDATE tasks SET status_id = $2, skipped_reason = $3, updated_at = NOW()
             WHERE id = $1 AND status_id = ANY($4)",
        )
        .bind(id)
        .bind(TaskStatus::Skipped.id())
        .bind(reason)
        .bind(&from)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !skipped {
            let exists: Option<DbId> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Ok(exists.map(|_| false));
        }

        sqlx::query(
            "UPDATE task_runs SET status_id = $2, detail = $3, finished_at = NOW()
             WHERE task_id = $1 AND status_id = $4",
        )
        .bind(id)
        .bind(TaskRunStatus::Canceled.id())
        .bind(format!("task skipped: {reason}"))
        .bind(TaskRunStatus::Pending.id())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(true))
    }
}
