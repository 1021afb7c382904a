//! Persistence seams.
//!
//! Every mutation of task or task-run status goes through one of the atomic
//! operations below; callers never read-then-write status themselves. The
//! in-memory implementation serialises them behind a mutex, the PostgreSQL
//! one uses conditional updates plus a partial unique index on active runs.
//!
//! A claimed run is held under a [`Lease`]. Only the holder may finish it,
//! and it goes back to `Pending` only once the holder stops renewing.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::approval::{ApprovalFinding, ApprovalSetting};
use crate::catalog::{
    CreateDatabase, CreateDatabaseGroup, CreateInstance, Database, DatabaseGroup,
    DeploymentConfig, Instance,
};
use crate::error::CoreResult;
use crate::executor::QueryResult;
use crate::issue::{CreateIssue, Issue};
use crate::risk::{CreateRiskRule, RiskRule};
use crate::rollout::{CreatePlan, Plan, Rollout, Stage, StageDraft, Task, TaskRun};
use crate::status::{TaskRunStatus, TaskStatus};
use crate::types::{DbId, Timestamp};

pub use memory::MemoryStore;

/// A worker's hold on the runs it executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub worker_id: String,
    /// How long a claim or renewal stays valid.
    pub ttl: Duration,
}

impl Lease {
    pub fn new(worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            ttl,
        }
    }

    /// Expiry of a claim or renewal made at `now`.
    pub fn expires_at(&self, now: Timestamp) -> Timestamp {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(now)
    }
}

/// Outcome of an attempt to create a task run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunClaim {
    /// This caller moved the task to `Pending` and owns the new run.
    Created(TaskRun),
    /// The task already has an outstanding run.
    Active(TaskStatus),
    /// The task is in a status the caller may not start from.
    Ineligible(TaskStatus),
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    /// The run had not started and is now `Canceled`.
    Canceled,
    /// The run is executing; it stops before its next statement.
    Requested,
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseFilter {
    pub project_id: Option<String>,
    pub instance_id: Option<String>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_instance(&self, input: &CreateInstance) -> CoreResult<Instance>;
    async fn get_instance(&self, id: &str) -> CoreResult<Option<Instance>>;
    async fn list_instances(&self) -> CoreResult<Vec<Instance>>;

    /// Register a database. `Conflict` if it already exists on the instance.
    async fn create_database(&self, instance_id: &str, input: &CreateDatabase) -> CoreResult<Database>;
    async fn list_databases(&self, filter: &DatabaseFilter) -> CoreResult<Vec<Database>>;

    async fn get_deployment_config(&self, project_id: &str) -> CoreResult<Option<DeploymentConfig>>;
    async fn upsert_deployment_config(&self, config: &DeploymentConfig) -> CoreResult<DeploymentConfig>;

    async fn create_database_group(
        &self,
        project_id: &str,
        input: &CreateDatabaseGroup,
    ) -> CoreResult<DatabaseGroup>;
    async fn get_database_group(&self, project_id: &str, group_id: &str) -> CoreResult<Option<DatabaseGroup>>;
    async fn list_database_groups(&self, project_id: &str) -> CoreResult<Vec<DatabaseGroup>>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn create_risk_rule(&self, input: &CreateRiskRule) -> CoreResult<RiskRule>;
    async fn list_risk_rules(&self) -> CoreResult<Vec<RiskRule>>;
    async fn get_approval_setting(&self) -> CoreResult<ApprovalSetting>;
    async fn set_approval_setting(&self, setting: &ApprovalSetting) -> CoreResult<ApprovalSetting>;
}

#[async_trait]
pub trait RolloutStore: Send + Sync {
    async fn create_plan(&self, project_id: &str, input: &CreatePlan) -> CoreResult<Plan>;
    async fn get_plan(&self, plan_id: DbId) -> CoreResult<Option<Plan>>;

    /// Persist a compiled rollout with every task `NotStarted`.
    /// `Conflict` if the plan already has a rollout.
    async fn create_rollout(&self, plan: &Plan, stages: &[StageDraft]) -> CoreResult<Rollout>;
    async fn get_rollout(&self, rollout_id: DbId) -> CoreResult<Option<Rollout>>;
    async fn get_rollout_by_plan(&self, plan_id: DbId) -> CoreResult<Option<Rollout>>;
    async fn get_stage(&self, stage_id: DbId) -> CoreResult<Option<Stage>>;
    async fn get_task(&self, task_id: DbId) -> CoreResult<Option<Task>>;

    /// Atomically move the task from one of `allowed_from` to `Pending` and
    /// create its run. Exactly one of any number of concurrent callers gets
    /// [`RunClaim::Created`].
    async fn claim_task_run(
        &self,
        task_id: DbId,
        allowed_from: &[TaskStatus],
        creator: &str,
    ) -> CoreResult<RunClaim>;

    /// Claim the oldest `Pending` run for execution under `lease`, moving it
    /// and its task to `Running`. Safe to call from many workers at once.
    async fn claim_pending_task_run(&self, lease: &Lease) -> CoreResult<Option<(TaskRun, Task)>>;

    /// Extend the lease on a `Running` run. Returns `false` when the run is
    /// no longer running under `lease.worker_id`.
    async fn renew_task_run_lease(&self, task_run_id: DbId, lease: &Lease) -> CoreResult<bool>;

    /// Record the outcome of a `Running` run held by `worker_id` and move its
    /// task to the matching status. `Conflict` if another worker holds it.
    async fn finish_task_run(
        &self,
        task_run_id: DbId,
        worker_id: &str,
        status: TaskRunStatus,
        results: &[QueryResult],
        detail: &str,
    ) -> CoreResult<TaskRun>;

    /// Skip a task from `NotStarted` or `Pending`, canceling a pending run.
    /// Returns `false` if the task was in any other status.
    async fn skip_task(&self, task_id: DbId, reason: &str) -> CoreResult<bool>;

    /// `FailedPrecondition` if the run is already terminal.
    async fn request_cancel(&self, task_run_id: DbId) -> CoreResult<CancelOutcome>;
    async fn is_cancel_requested(&self, task_run_id: DbId) -> CoreResult<bool>;

    async fn get_task_run(&self, task_run_id: DbId) -> CoreResult<Option<TaskRun>>;
    /// All runs of a task, oldest first.
    async fn list_task_runs(&self, task_id: DbId) -> CoreResult<Vec<TaskRun>>;

    /// Put `Running` runs whose lease has expired back to `Pending`. Runs
    /// held by a live, renewing worker are left alone.
    async fn requeue_expired_task_runs(&self) -> CoreResult<u64>;
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    /// `Conflict` if the plan already has an issue.
    async fn create_issue(&self, project_id: &str, input: &CreateIssue) -> CoreResult<Issue>;
    async fn get_issue(&self, issue_id: DbId) -> CoreResult<Option<Issue>>;
    async fn get_issue_by_plan(&self, plan_id: DbId) -> CoreResult<Option<Issue>>;
    /// Open issues whose approval finding is not done, oldest first.
    async fn list_issues_awaiting_approval_finding(&self) -> CoreResult<Vec<Issue>>;

    /// Store a completed finding if the issue's finding is not done yet.
    /// Returns `false` when another writer completed it first.
    async fn complete_approval_finding(&self, issue_id: DbId, finding: &ApprovalFinding) -> CoreResult<bool>;

    /// Replace the finding of a done issue (approve / reject), provided it
    /// still equals `expected`, the finding the change was computed from.
    /// `Conflict` when another approver got there first.
    async fn update_approval(
        &self,
        issue_id: DbId,
        expected: &ApprovalFinding,
        finding: &ApprovalFinding,
    ) -> CoreResult<Issue>;
}

/// The full store surface the engine and API depend on.
pub trait Store: CatalogStore + PolicyStore + RolloutStore + IssueStore {}

impl<T> Store for T where T: CatalogStore + PolicyStore + RolloutStore + IssueStore {}
