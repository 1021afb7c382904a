//! [`PgStore`]: the core store traits over PostgreSQL.

use std::collections::HashMap;

use async_trait::async_trait;
use rollgate_core::approval::{ApprovalFinding, ApprovalSetting};
use rollgate_core::catalog::{
    CreateDatabase, CreateDatabaseGroup, CreateInstance, Database, DatabaseGroup,
    DeploymentConfig, Instance,
};
use rollgate_core::error::{CoreError, CoreResult};
use rollgate_core::executor::QueryResult;
use rollgate_core::issue::{CreateIssue, Issue};
use rollgate_core::risk::{CreateRiskRule, RiskRule};
use rollgate_core::rollout::{CreatePlan, Plan, Rollout, Stage, StageDraft, Task, TaskRun};
use rollgate_core::status::{StatusId, TaskRunStatus, TaskStatus};
use rollgate_core::store::{
    CancelOutcome, CatalogStore, DatabaseFilter, IssueStore, Lease, PolicyStore, RolloutStore,
    RunClaim,
};
use rollgate_core::types::DbId;

use crate::models::rollout::{CancelResult, RolloutRow, TaskClaim};
use crate::repositories::{
    ApprovalSettingRepo, DatabaseGroupRepo, DatabaseRepo, DeploymentConfigRepo, InstanceRepo,
    IssueRepo, PlanRepo, RiskRuleRepo, RolloutRepo, TaskRepo, TaskRunRepo,
};
use crate::DbPool;

/// Map a driver error onto the core taxonomy.
///
/// - Unique violations (`23505`) become `Conflict`.
/// - Foreign key violations (`23503`) become `Validation`.
/// - `RowNotFound` becomes `NotFound`.
/// - Everything else is logged and becomes `Internal`.
pub fn db_err(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("23505") => {
                return CoreError::Conflict(format!(
                    "duplicate value violates unique constraint {}",
                    db.constraint().unwrap_or("unknown")
                ))
            }
            Some("23503") => {
                return CoreError::Validation(format!(
                    "referenced row does not exist ({})",
                    db.constraint().unwrap_or("unknown")
                ))
            }
            _ => {}
        }
    }
    if let sqlx::Error::RowNotFound = err {
        return CoreError::not_found("row", "unknown");
    }
    tracing::error!(error = %err, "Database error");
    CoreError::Internal("database error".into())
}

fn is_constraint(err: &sqlx::Error, name: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.constraint() == Some(name))
}

fn task_status(id: StatusId) -> CoreResult<TaskStatus> {
    TaskStatus::from_id(id).ok_or_else(|| CoreError::Internal(format!("unexpected task status id {id}")))
}

/// Store backed by the control-plane PostgreSQL database.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn assemble_rollout(&self, row: RolloutRow) -> CoreResult<Rollout> {
        let stages = RolloutRepo::list_stages(&self.pool, row.id).await.map_err(db_err)?;
        let mut tasks_by_stage: HashMap<DbId, Vec<Task>> = HashMap::new();
        for task in TaskRepo::list_for_rollout(&self.pool, row.id).await.map_err(db_err)? {
            let task = Task::try_from(task)?;
            tasks_by_stage.entry(task.stage_id).or_default().push(task);
        }
        Ok(Rollout {
            id: row.id,
            project_id: row.project_id,
            plan_id: row.plan_id,
            stages: stages
                .into_iter()
                .map(|s| {
                    let tasks = tasks_by_stage.remove(&s.id).unwrap_or_default();
                    s.with_tasks(tasks)
                })
                .collect(),
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn create_instance(&self, input: &CreateInstance) -> CoreResult<Instance> {
        InstanceRepo::create(&self.pool, input).await.map_err(db_err)?.try_into()
    }

    async fn get_instance(&self, id: &str) -> CoreResult<Option<Instance>> {
        InstanceRepo::find_by_id(&self.pool, id)
            .await
            .map_err(db_err)?
            .map(Instance::try_from)
            .transpose()
    }

    async fn list_instances(&self) -> CoreResult<Vec<Instance>> {
        InstanceRepo::list(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Instance::try_from)
            .collect()
    }

    async fn create_database(&self, instance_id: &str, input: &CreateDatabase) -> CoreResult<Database> {
        DatabaseRepo::create(&self.pool, instance_id, input)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CoreError::not_found("instance", instance_id))?
            .try_into()
    }

    async fn list_databases(&self, filter: &DatabaseFilter) -> CoreResult<Vec<Database>> {
        DatabaseRepo::list(
            &self.pool,
            filter.project_id.as_deref(),
            filter.instance_id.as_deref(),
        )
        .await
        .map_err(db_err)?
        .into_iter()
        .map(Database::try_from)
        .collect()
    }

    async fn get_deployment_config(&self, project_id: &str) -> CoreResult<Option<DeploymentConfig>> {
        Ok(DeploymentConfigRepo::find(&self.pool, project_id)
            .await
            .map_err(db_err)?
            .map(Into::into))
    }

    async fn upsert_deployment_config(&self, config: &DeploymentConfig) -> CoreResult<DeploymentConfig> {
        Ok(DeploymentConfigRepo::upsert(&self.pool, config)
            .await
            .map_err(db_err)?
            .into())
    }

    async fn create_database_group(
        &self,
        project_id: &str,
        input: &CreateDatabaseGroup,
    ) -> CoreResult<DatabaseGroup> {
        Ok(DatabaseGroupRepo::create(&self.pool, project_id, input)
            .await
            .map_err(db_err)?
            .into())
    }

    async fn get_database_group(&self, project_id: &str, group_id: &str) -> CoreResult<Option<DatabaseGroup>> {
        Ok(DatabaseGroupRepo::find(&self.pool, project_id, group_id)
            .await
            .map_err(db_err)?
            .map(Into::into))
    }

    async fn list_database_groups(&self, project_id: &str) -> CoreResult<Vec<DatabaseGroup>> {
        Ok(DatabaseGroupRepo::list_for_project(&self.pool, project_id)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}

#[async_trait]
impl PolicyStore for PgStore {
    async fn create_risk_rule(&self, input: &CreateRiskRule) -> CoreResult<RiskRule> {
        RiskRuleRepo::create(&self.pool, input).await.map_err(db_err)?.try_into()
    }

    async fn list_risk_rules(&self) -> CoreResult<Vec<RiskRule>> {
        RiskRuleRepo::list(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(RiskRule::try_from)
            .collect()
    }

    async fn get_approval_setting(&self) -> CoreResult<ApprovalSetting> {
        Ok(ApprovalSettingRepo::find(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| row.setting.0)
            .unwrap_or_default())
    }

    async fn set_approval_setting(&self, setting: &ApprovalSetting) -> CoreResult<ApprovalSetting> {
        Ok(ApprovalSettingRepo::upsert(&self.pool, setting)
            .await
            .map_err(db_err)?
            .setting
            .0)
    }
}

#[async_trait]
impl RolloutStore for PgStore {
    async fn create_plan(&self, project_id: &str, input: &CreatePlan) -> CoreResult<Plan> {
        Ok(PlanRepo::create(&self.pool, project_id, input)
            .await
            .map_err(db_err)?
            .into())
    }

    async fn get_plan(&self, plan_id: DbId) -> CoreResult<Option<Plan>> {
        Ok(PlanRepo::find_by_id(&self.pool, plan_id)
            .await
            .map_err(db_err)?
            .map(Into::into))
    }

    async fn create_rollout(&self, plan: &Plan, stages: &[StageDraft]) -> CoreResult<Rollout> {
        let rollout_id = RolloutRepo::create(&self.pool, &plan.project_id, plan.id, stages)
            .await
            .map_err(|e| {
                if is_constraint(&e, "uq_rollouts_plan") {
                    CoreError::Conflict(format!("plan {} already has a rollout", plan.id))
                } else {
                    db_err(e)
                }
            })?;
        self.get_rollout(rollout_id)
            .await?
            .ok_or_else(|| CoreError::not_found("rollout", rollout_id))
    }

    async fn get_rollout(&self, rollout_id: DbId) -> CoreResult<Option<Rollout>> {
        match RolloutRepo::find_by_id(&self.pool, rollout_id).await.map_err(db_err)? {
            Some(row) => self.assemble_rollout(row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn get_rollout_by_plan(&self, plan_id: DbId) -> CoreResult<Option<Rollout>> {
        match RolloutRepo::find_by_plan(&self.pool, plan_id).await.map_err(db_err)? {
            Some(row) => self.assemble_rollout(row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn get_stage(&self, stage_id: DbId) -> CoreResult<Option<Stage>> {
        let Some(stage) = RolloutRepo::find_stage(&self.pool, stage_id).await.map_err(db_err)? else {
            return Ok(None);
        };
        let tasks = TaskRepo::list_for_stage(&self.pool, stage_id)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Task::try_from)
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Some(stage.with_tasks(tasks)))
    }

    async fn get_task(&self, task_id: DbId) -> CoreResult<Option<Task>> {
        TaskRepo::find_by_id(&self.pool, task_id)
            .await
            .map_err(db_err)?
            .map(Task::try_from)
            .transpose()
    }

    async fn claim_task_run(
        &self,
        task_id: DbId,
        allowed_from: &[TaskStatus],
        creator: &str,
    ) -> CoreResult<RunClaim> {
        let allowed: Vec<StatusId> = allowed_from.iter().map(|s| s.id()).collect();
        match TaskRunRepo::claim_for_task(&self.pool, task_id, &allowed, creator).await {
            Ok(TaskClaim::Created(run)) => Ok(RunClaim::Created(run.try_into()?)),
            Ok(TaskClaim::Refused(status_id)) => {
                let status = task_status(status_id)?;
                if status.is_active() {
                    Ok(RunClaim::Active(status))
                } else {
                    Ok(RunClaim::Ineligible(status))
                }
            }
            Ok(TaskClaim::Missing) => Err(CoreError::not_found("task", task_id)),
            Err(e) if is_constraint(&e, "uq_task_runs_active") => Ok(RunClaim::Active(TaskStatus::Pending)),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn claim_pending_task_run(&self, lease: &Lease) -> CoreResult<Option<(TaskRun, Task)>> {
        match TaskRunRepo::claim_next(&self.pool, &lease.worker_id, lease.ttl)
            .await
            .map_err(db_err)?
        {
            Some((run, task)) => Ok(Some((run.try_into()?, task.try_into()?))),
            None => Ok(None),
        }
    }

    async fn renew_task_run_lease(&self, task_run_id: DbId, lease: &Lease) -> CoreResult<bool> {
        TaskRunRepo::renew_lease(&self.pool, task_run_id, &lease.worker_id, lease.ttl)
            .await
            .map_err(db_err)
    }

    async fn finish_task_run(
        &self,
        task_run_id: DbId,
        worker_id: &str,
        status: TaskRunStatus,
        results: &[QueryResult],
        detail: &str,
    ) -> CoreResult<TaskRun> {
        if !status.is_terminal() {
            return Err(CoreError::FailedPrecondition(format!(
                "cannot finish task run {task_run_id} with non-terminal status {status}"
            )));
        }
        match TaskRunRepo::finish(&self.pool, task_run_id, worker_id, status, results, detail)
            .await
            .map_err(db_err)?
        {
            Some(run) => run.try_into(),
            None => match self.get_task_run(task_run_id).await? {
                Some(run) if run.status == TaskRunStatus::Running => Err(CoreError::Conflict(format!(
                    "task run {task_run_id} is not held by worker {worker_id}"
                ))),
                Some(run) => Err(CoreError::FailedPrecondition(format!(
                    "cannot finish task run {task_run_id} from {}",
                    run.status
                ))),
                None => Err(CoreError::not_found("task run", task_run_id)),
            },
        }
    }

    async fn skip_task(&self, task_id: DbId, reason: &str) -> CoreResult<bool> {
        TaskRepo::skip(&self.pool, task_id, reason)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    async fn request_cancel(&self, task_run_id: DbId) -> CoreResult<CancelOutcome> {
        match TaskRunRepo::request_cancel(&self.pool, task_run_id)
            .await
            .map_err(db_err)?
        {
            CancelResult::Canceled => Ok(CancelOutcome::Canceled),
            CancelResult::Requested => Ok(CancelOutcome::Requested),
            CancelResult::Terminal(status_id) => {
                let label = TaskRunStatus::from_id(status_id).map_or("UNKNOWN", TaskRunStatus::as_str);
                Err(CoreError::FailedPrecondition(format!(
                    "task run {task_run_id} is already {label}"
                )))
            }
            CancelResult::Missing => Err(CoreError::not_found("task run", task_run_id)),
        }
    }

    async fn is_cancel_requested(&self, task_run_id: DbId) -> CoreResult<bool> {
        TaskRunRepo::is_cancel_requested(&self.pool, task_run_id)
            .await
            .map_err(db_err)
    }

    async fn get_task_run(&self, task_run_id: DbId) -> CoreResult<Option<TaskRun>> {
        TaskRunRepo::find_by_id(&self.pool, task_run_id)
            .await
            .map_err(db_err)?
            .map(TaskRun::try_from)
            .transpose()
    }

    async fn list_task_runs(&self, task_id: DbId) -> CoreResult<Vec<TaskRun>> {
        TaskRunRepo::list_for_task(&self.pool, task_id)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(TaskRun::try_from)
            .collect()
    }

    async fn requeue_expired_task_runs(&self) -> CoreResult<u64> {
        TaskRunRepo::requeue_expired(&self.pool).await.map_err(db_err)
    }
}

#[async_trait]
impl IssueStore for PgStore {
    async fn create_issue(&self, project_id: &str, input: &CreateIssue) -> CoreResult<Issue> {
        IssueRepo::create(&self.pool, project_id, input)
            .await
            .map_err(|e| {
                if is_constraint(&e, "uq_issues_plan") {
                    CoreError::Conflict(format!("plan {} already has an issue", input.plan_id))
                } else if is_constraint(&e, "issues_plan_id_fkey") {
                    CoreError::not_found("plan", input.plan_id)
                } else {
                    db_err(e)
                }
            })?
            .try_into()
    }

    async fn get_issue(&self, issue_id: DbId) -> CoreResult<Option<Issue>> {
        IssueRepo::find_by_id(&self.pool, issue_id)
            .await
            .map_err(db_err)?
            .map(Issue::try_from)
            .transpose()
    }

    async fn get_issue_by_plan(&self, plan_id: DbId) -> CoreResult<Option<Issue>> {
        IssueRepo::find_by_plan(&self.pool, plan_id)
            .await
            .map_err(db_err)?
            .map(Issue::try_from)
            .transpose()
    }

    async fn list_issues_awaiting_approval_finding(&self) -> CoreResult<Vec<Issue>> {
        IssueRepo::list_awaiting_finding(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Issue::try_from)
            .collect()
    }

    async fn complete_approval_finding(&self, issue_id: DbId, finding: &ApprovalFinding) -> CoreResult<bool> {
        let mut finding = finding.clone();
        finding.done = true;
        IssueRepo::complete_finding(&self.pool, issue_id, &finding)
            .await
            .map_err(db_err)
    }

    async fn update_approval(
        &self,
        issue_id: DbId,
        expected: &ApprovalFinding,
        finding: &ApprovalFinding,
    ) -> CoreResult<Issue> {
        match IssueRepo::update_approval(&self.pool, issue_id, expected, finding)
            .await
            .map_err(db_err)?
        {
            Some(row) => row.try_into(),
            None => match self.get_issue(issue_id).await? {
                Some(issue) if issue.approval.done => Err(CoreError::Conflict(format!(
                    "issue {issue_id} approval changed concurrently, reload and retry"
                ))),
                Some(_) => Err(CoreError::FailedPrecondition(format!(
                    "issue {issue_id} approval finding is not done"
                ))),
                None => Err(CoreError::not_found("issue", issue_id)),
            },
        }
    }
}
