//! Rows of `issues`.

use rollgate_core::approval::ApprovalFinding;
use rollgate_core::error::CoreError;
use rollgate_core::issue::Issue;
use rollgate_core::status::{IssueStatus, StatusId};
use rollgate_core::types::{DbId, Timestamp};
use sqlx::types::Json;
use sqlx::FromRow;

use super::corrupt;

#[derive(Debug, Clone, FromRow)]
pub struct IssueRow {
    pub id: DbId,
    pub project_id: String,
    pub plan_id: DbId,
    pub title: String,
    pub status_id: StatusId,
    pub creator: String,
    /// Authoritative done flag; the JSON copy is overwritten from it.
    pub approval_finding_done: bool,
    pub approval: Json<ApprovalFinding>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<IssueRow> for Issue {
    type Error = CoreError;

    fn try_from(row: IssueRow) -> Result<Self, Self::Error> {
        let status =
            IssueStatus::from_id(row.status_id).ok_or_else(|| corrupt("issues", "status_id", row.status_id))?;
        let mut approval = row.approval.0;
        approval.done = row.approval_finding_done;
        Ok(Issue {
            id: row.id,
            project_id: row.project_id,
            plan_id: row.plan_id,
            title: row.title,
            status,
            creator: row.creator,
            approval,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
