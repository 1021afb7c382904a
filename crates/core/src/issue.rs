//! Issues: the review container that owns a plan and its approval finding.

use serde::{Deserialize, Serialize};

use crate::approval::{ApprovalFinding, ApprovalStatus};
use crate::risk::RiskLevel;
use crate::status::IssueStatus;
use crate::types::{DbId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: DbId,
    pub project_id: String,
    pub plan_id: DbId,
    pub title: String,
    pub status: IssueStatus,
    pub creator: String,
    pub approval: ApprovalFinding,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Issue {
    pub fn risk_level(&self) -> RiskLevel {
        self.approval.risk_level
    }

    pub fn approval_finding_done(&self) -> bool {
        self.approval.done
    }

    pub fn approval_status(&self) -> ApprovalStatus {
        self.approval.status()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIssue {
    pub plan_id: DbId,
    pub title: String,
    #[serde(default)]
    pub creator: Option<String>,
}

/// Approve / reject request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalAction {
    pub role: String,
    pub principal: String,
}
