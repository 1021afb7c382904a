//! Repository for the `issues` table.

use rollgate_core::approval::ApprovalFinding;
use rollgate_core::issue::CreateIssue;
use rollgate_core::status::IssueStatus;
use rollgate_core::types::DbId;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::issue::IssueRow;

const COLUMNS: &str = "id, project_id, plan_id, title, status_id, creator, \
    approval_finding_done, approval, created_at, updated_at";

pub struct IssueRepo;

impl IssueRepo {
    pub async fn create(pool: &PgPool, project_id: &str, input: &CreateIssue) -> Result<IssueRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO issues (project_id, plan_id, title, status_id, creator, approval)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, IssueRow>(&query)
            .bind(project_id)
            .bind(input.plan_id)
            .bind(&input.title)
            .bind(IssueStatus::Open.id())
            .bind(input.creator.as_deref().unwrap_or_default())
            .bind(Json(ApprovalFinding::default()))
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<IssueRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM issues WHERE id = $1");
        sqlx::query_as::<_, IssueRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_plan(pool: &PgPool, plan_id: DbId) -> Result<Option<IssueRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM issues WHERE plan_id = $1");
        sqlx::query_as::<_, IssueRow>(&query)
            .bind(plan_id)
            .fetch_optional(pool)
            .await
    }

    /// Open issues whose approval finding has not completed, oldest first.
    pub async fn list_awaiting_finding(pool: &PgPool) -> Result<Vec<IssueRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM issues
             WHERE status_id = $1 AND NOT approval_finding_done
             ORDER BY id"
        );
        sqlx::query_as::<_, IssueRow>(&query)
            .bind(IssueStatus::Open.id())
            .fetch_all(pool)
            .await
    }

    /// Store a finding and flip `approval_finding_done` exactly once.
    /// Returns `false` if the finding was already done.
    pub async fn complete_finding(pool: &PgPool, id: DbId, finding: &ApprovalFinding) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE issues SET approval = $2, approval_finding_done = TRUE, updated_at = NOW()
             WHERE id = $1 AND NOT approval_finding_done",
        )
        .bind(id)
        .bind(Json(finding))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the finding of an issue whose finding is done and still
    /// equals `expected`. JSONB equality ignores key order, so a finding
    /// read back from this column compares equal to itself.
    pub async fn update_approval(
        pool: &PgPool,
        id: DbId,
        expected: &ApprovalFinding,
        finding: &ApprovalFinding,
    ) -> Result<Option<IssueRow>, sqlx::Error> {
        let query = format!(
            "UPDATE issues SET approval = $2, updated_at = NOW()
             WHERE id = $1 AND approval_finding_done AND approval = $3
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, IssueRow>(&query)
            .bind(id)
            .bind(Json(finding))
            .bind(Json(expected))
            .fetch_optional(pool)
            .await
    }
}
