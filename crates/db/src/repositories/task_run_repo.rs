//! Repository for the `task_runs` table.
//!
//! Every method that changes a run's status also moves its task in the same
//! transaction, so task and run status never disagree.

use std::time::Duration;

use rollgate_core::executor::QueryResult;
use rollgate_core::status::{StatusId, TaskRunStatus, TaskStatus};
use rollgate_core::types::DbId;
use sqlx::types::Json;
use sqlx::PgPool;

use super::rollout_repo::TASK_COLUMNS;
use crate::models::rollout::{CancelResult, TaskClaim, TaskRow, TaskRunRow};

const COLUMNS: &str = "id, task_id, attempt, status_id, creator, results, detail, \
    cancel_requested, worker_id, lease_expires_at, created_at, started_at, finished_at";

pub struct TaskRunRepo;

impl TaskRunRepo {
    /// Compare-and-swap the task from one of `allowed_from` to `PENDING` and
    /// insert its next run.
    ///
    /// The conditional `UPDATE` takes the task's row lock, so concurrent
    /// callers serialise on it and re-check the status after the winner
    /// commits. `uq_task_runs_active` backs this up at the storage layer.
    pub async fn claim_for_task(
        pool: &PgPool,
        task_id: DbId,
        allowed_from: &[StatusId],
        creator: &str,
    ) -> Result<TaskClaim, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let moved = sqlx::query(
            "UPDATE tasks SET status_id = $2, skipped_reason = NULL, updated_at = NOW()
             WHERE id = $1 AND status_id = ANY($3)",
        )
        .bind(task_id)
        .bind(TaskStatus::Pending.id())
        .bind(allowed_from)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !moved {
            let current: Option<StatusId> = sqlx::query_scalar("SELECT status_id FROM tasks WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Ok(current.map_or(TaskClaim::Missing, TaskClaim::Refused));
        }

        let query = format!(
            "INSERT INTO task_runs (task_id, attempt, status_id, creator)
             VALUES ($1, (SELECT COUNT(*) + 1 FROM task_runs WHERE task_id = $1)::INTEGER, $2, $3)
             RETURNING {COLUMNS}"
        );
        let run = sqlx::query_as::<_, TaskRunRow>(&query)
            .bind(task_id)
            .bind(TaskRunStatus::Pending.id())
            .bind(creator)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(TaskClaim::Created(run))
    }

    /// Claim the oldest pending run for execution under a lease held by
    /// `worker_id`.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent dispatchers never
    /// receive the same run.
    pub async fn claim_next(
        pool: &PgPool,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<(TaskRunRow, TaskRow)>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "UPDATE task_runs SET status_id = $1, started_at = NOW(), worker_id = $3,
                 lease_expires_at = NOW() + make_interval(secs => $4)
             WHERE id = (
                 SELECT id FROM task_runs
                 WHERE status_id = $2
                 ORDER BY id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        );
        let Some(run) = sqlx::query_as::<_, TaskRunRow>(&query)
            .bind(TaskRunStatus::Running.id())
            .bind(TaskRunStatus::Pending.id())
            .bind(worker_id)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let query = format!(
            "UPDATE tasks SET status_id = $2, updated_at = NOW() WHERE id = $1 RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<_, TaskRow>(&query)
            .bind(run.task_id)
            .bind(TaskStatus::Running.id())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some((run, task)))
    }

    /// Push out the lease of a run still `RUNNING` under `worker_id`.
    pub async fn renew_lease(
        pool: &PgPool,
        id: DbId,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, sqlx::Error> {
        let renewed = sqlx::query(
            "UPDATE task_runs SET lease_expires_at = NOW() + make_interval(secs => $3)
             WHERE id = $1 AND worker_id = $2 AND status_id = $4",
        )
        .bind(id)
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .bind(TaskRunStatus::Running.id())
        .execute(pool)
        .await?
        .rows_affected();
        Ok(renewed > 0)
    }

    /// Record the outcome of a `RUNNING` run held by `worker_id`. Returns
    /// `None` if the run is missing, not running, or held by another worker.
    pub async fn finish(
        pool: &PgPool,
        id: DbId,
        worker_id: &str,
        status: TaskRunStatus,
        results: &[QueryResult],
        detail: &str,
    ) -> Result<Option<TaskRunRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "UPDATE task_runs SET status_id = $2, results = $3, detail = $4, finished_at = NOW()
             WHERE id = $1 AND status_id = $5 AND worker_id = $6
             RETURNING {COLUMNS}"
        );
        let Some(run) = sqlx::query_as::<_, TaskRunRow>(&query)
            .bind(id)
            .bind(status.id())
            .bind(Json(results))
            .bind(detail)
            .bind(TaskRunStatus::Running.id())
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE tasks SET status_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(run.task_id)
            .bind(status.task_status().id())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(run))
    }

    pub async fn request_cancel(pool: &PgPool, id: DbId) -> Result<CancelResult, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let row: Option<(StatusId, DbId)> =
            sqlx::query_as("SELECT status_id, task_id FROM task_runs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((status_id, task_id)) = row else {
            tx.rollback().await?;
            return Ok(CancelResult::Missing);
        };

        let outcome = match TaskRunStatus::from_id(status_id) {
            Some(TaskRunStatus::Pending) => {
                sqlx::query(
                    "UPDATE task_runs SET status_id = $2, detail = 'canceled before start', finished_at = NOW()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(TaskRunStatus::Canceled.id())
                .execute(&mut *tx)
                .await?;
                sqlx::query("UPDATE tasks SET status_id = $2, updated_at = NOW() WHERE id = $1")
                    .bind(task_id)
                    .bind(TaskStatus::Canceled.id())
                    .execute(&mut *tx)
                    .await?;
                CancelResult::Canceled
            }
            Some(TaskRunStatus::Running) => {
                sqlx::query("UPDATE task_runs SET cancel_requested = TRUE WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                CancelResult::Requested
            }
            _ => CancelResult::Terminal(status_id),
        };

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn is_cancel_requested(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let flag: Option<bool> = sqlx::query_scalar("SELECT cancel_requested FROM task_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(flag.unwrap_or(false))
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<TaskRunRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM task_runs WHERE id = $1");
        sqlx::query_as::<_, TaskRunRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// All runs of a task, oldest first.
    pub async fn list_for_task(pool: &PgPool, task_id: DbId) -> Result<Vec<TaskRunRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM task_runs WHERE task_id = $1 ORDER BY created_at, id");
        sqlx::query_as::<_, TaskRunRow>(&query)
            .bind(task_id)
            .fetch_all(pool)
            .await
    }

    /// Put `RUNNING` runs whose lease has lapsed (and their tasks) back to
    /// `PENDING` in one statement, so a concurrent renewal either lands
    /// first and keeps the run or finds it requeued.
    pub async fn requeue_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let requeued = sqlx::query(
            "WITH expired AS (
                 UPDATE task_runs
                 SET status_id = $1, started_at = NULL, worker_id = NULL, lease_expires_at = NULL
                 WHERE status_id = $2 AND (lease_expires_at IS NULL OR lease_expires_at < NOW())
                 RETURNING task_id
             )
             UPDATE tasks SET status_id = $3, updated_at = NOW()
             WHERE id IN (SELECT task_id FROM expired)",
        )
        .bind(TaskRunStatus::Pending.id())
        .bind(TaskRunStatus::Running.id())
        .bind(TaskStatus::Pending.id())
        .execute(pool)
        .await?
        .rows_affected();
        Ok(requeued)
    }
}
