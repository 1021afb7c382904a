//! In-memory store: an id-addressed arena behind a single mutex.
//!
//! Every trait method takes the lock once and never awaits while holding it,
//! so each operation is atomic with respect to all others.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    CancelOutcome, CatalogStore, DatabaseFilter, IssueStore, Lease, PolicyStore, RolloutStore,
    RunClaim,
};
use crate::approval::{ApprovalFinding, ApprovalSetting};
use crate::catalog::{
    CreateDatabase, CreateDatabaseGroup, CreateInstance, Database, DatabaseGroup,
    DeploymentConfig, Instance,
};
use crate::error::{CoreError, CoreResult};
use crate::executor::QueryResult;
use crate::issue::{CreateIssue, Issue};
use crate::risk::{CreateRiskRule, RiskRule};
use crate::rollout::{CreatePlan, Plan, Rollout, Stage, StageDraft, Task, TaskRun};
use crate::scheduling::state_machine;
use crate::status::{IssueStatus, TaskRunStatus, TaskStatus};
use crate::types::DbId;

struct RolloutRow {
    id: DbId,
    project_id: String,
    plan_id: DbId,
    stage_ids: Vec<DbId>,
    created_at: crate::types::Timestamp,
}

struct StageRow {
    id: DbId,
    rollout_id: DbId,
    environment_id: String,
    position: i32,
    task_ids: Vec<DbId>,
}

#[derive(Default)]
struct State {
    next_id: DbId,
    instances: BTreeMap<String, Instance>,
    databases: Vec<Database>,
    configs: HashMap<String, DeploymentConfig>,
    groups: Vec<DatabaseGroup>,
    risk_rules: Vec<RiskRule>,
    approval_setting: ApprovalSetting,
    plans: BTreeMap<DbId, Plan>,
    rollouts: BTreeMap<DbId, RolloutRow>,
    stages: BTreeMap<DbId, StageRow>,
    tasks: BTreeMap<DbId, Task>,
    runs: BTreeMap<DbId, TaskRun>,
    issues: BTreeMap<DbId, Issue>,
}

impl State {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    fn stage(&self, stage_id: DbId) -> Option<Stage> {
        let row = self.stages.get(&stage_id)?;
        Some(Stage {
            id: row.id,
            rollout_id: row.rollout_id,
            environment_id: row.environment_id.clone(),
            position: row.position,
            tasks: row
                .task_ids
                .iter()
                .filter_map(|id| self.tasks.get(id).cloned())
                .collect(),
        })
    }

    fn rollout(&self, rollout_id: DbId) -> Option<Rollout> {
        let row = self.rollouts.get(&rollout_id)?;
        Some(Rollout {
            id: row.id,
            project_id: row.project_id.clone(),
            plan_id: row.plan_id,
            stages: row.stage_ids.iter().filter_map(|id| self.stage(*id)).collect(),
            created_at: row.created_at,
        })
    }

    fn set_task_status(&mut self, task_id: DbId, to: TaskStatus) -> CoreResult<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::not_found("task", task_id))?;
        state_machine::validate_transition(task.status, to).map_err(CoreError::Internal)?;
        task.status = to;
        task.updated_at = Utc::now();
        Ok(())
    }
}

/// Store used by tests and by `STORE_BACKEND=memory`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> CoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| CoreError::Internal("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn create_instance(&self, input: &CreateInstance) -> CoreResult<Instance> {
        let mut s = self.state()?;
        if s.instances.contains_key(&input.id) {
            return Err(CoreError::Conflict(format!("instance {} already exists", input.id)));
        }
        let instance = Instance {
            id: input.id.clone(),
            title: input.title.clone().unwrap_or_else(|| input.id.clone()),
            engine: input.engine,
            environment_id: input.environment_id.clone(),
            data_source_url: input.data_source_url.clone(),
            created_at: Utc::now(),
        };
        s.instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: &str) -> CoreResult<Option<Instance>> {
        Ok(self.state()?.instances.get(id).cloned())
    }

    async fn list_instances(&self) -> CoreResult<Vec<Instance>> {
        Ok(self.state()?.instances.values().cloned().collect())
    }

    async fn create_database(&self, instance_id: &str, input: &CreateDatabase) -> CoreResult<Database> {
        let mut s = self.state()?;
        let instance = s
            .instances
            .get(instance_id)
            .ok_or_else(|| CoreError::not_found("instance", instance_id))?;
        let database = Database {
            instance_id: instance.id.clone(),
            name: input.name.clone(),
            project_id: input.project_id.clone(),
            environment_id: input
                .environment_id
                .clone()
                .unwrap_or_else(|| instance.environment_id.clone()),
            engine: instance.engine,
        };
        if s
            .databases
            .iter()
            .any(|d| d.instance_id == database.instance_id && d.name == database.name)
        {
            return Err(CoreError::Conflict(format!(
                "database {} already exists",
                database.resource_name()
            )));
        }
        s.databases.push(database.clone());
        Ok(database)
    }

    async fn list_databases(&self, filter: &DatabaseFilter) -> CoreResult<Vec<Database>> {
        let s = self.state()?;
        let mut out: Vec<Database> = s
            .databases
            .iter()
            .filter(|d| filter.project_id.as_ref().map_or(true, |p| &d.project_id == p))
            .filter(|d| filter.instance_id.as_ref().map_or(true, |i| &d.instance_id == i))
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.instance_id, &a.name).cmp(&(&b.instance_id, &b.name)));
        Ok(out)
    }

    async fn get_deployment_config(&self, project_id: &str) -> CoreResult<Option<DeploymentConfig>> {
        Ok(self.state()?.configs.get(project_id).cloned())
    }

    async fn upsert_deployment_config(&self, config: &DeploymentConfig) -> CoreResult<DeploymentConfig> {
        self.state()?
            .configs
            .insert(config.project_id.clone(), config.clone());
        Ok(config.clone())
    }

    async fn create_database_group(
        &self,
        project_id: &str,
        input: &CreateDatabaseGroup,
    ) -> CoreResult<DatabaseGroup> {
        let mut s = self.state()?;
        if s
            .groups
            .iter()
            .any(|g| g.project_id == project_id && g.group_id == input.group_id)
        {
            return Err(CoreError::Conflict(format!(
                "database group {} already exists",
                input.group_id
            )));
        }
        let group = DatabaseGroup {
            project_id: project_id.to_string(),
            group_id: input.group_id.clone(),
            title: input.title.clone().unwrap_or_else(|| input.group_id.clone()),
            expression: input.expression.clone(),
            created_at: Utc::now(),
        };
        s.groups.push(group.clone());
        Ok(group)
    }

    async fn get_database_group(&self, project_id: &str, group_id: &str) -> CoreResult<Option<DatabaseGroup>> {
        Ok(self
            .state()?
            .groups
            .iter()
            .find(|g| g.project_id == project_id && g.group_id == group_id)
            .cloned())
    }

    async fn list_database_groups(&self, project_id: &str) -> CoreResult<Vec<DatabaseGroup>> {
        Ok(self
            .state()?
            .groups
            .iter()
            .filter(|g| g.project_id == project_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn create_risk_rule(&self, input: &CreateRiskRule) -> CoreResult<RiskRule> {
        let mut s = self.state()?;
        let rule = RiskRule {
            id: s.next_id(),
            title: input.title.clone(),
            source: input.source,
            level: input.level,
            expression: input.expression.clone(),
            active: input.active,
            created_at: Utc::now(),
        };
        s.risk_rules.push(rule.clone());
        Ok(rule)
    }

    async fn list_risk_rules(&self) -> CoreResult<Vec<RiskRule>> {
        Ok(self.state()?.risk_rules.clone())
    }

    async fn get_approval_setting(&self) -> CoreResult<ApprovalSetting> {
        Ok(self.state()?.approval_setting.clone())
    }

    async fn set_approval_setting(&self, setting: &ApprovalSetting) -> CoreResult<ApprovalSetting> {
        self.state()?.approval_setting = setting.clone();
        Ok(setting.clone())
    }
}

#[async_trait]
impl RolloutStore for MemoryStore {
    async fn create_plan(&self, project_id: &str, input: &CreatePlan) -> CoreResult<Plan> {
        let mut s = self.state()?;
        let plan = Plan {
            id: s.next_id(),
            project_id: project_id.to_string(),
            title: input.title.clone(),
            specs: input.specs.clone(),
            creator: input.creator.clone().unwrap_or_default(),
            created_at: Utc::now(),
        };
        s.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn get_plan(&self, plan_id: DbId) -> CoreResult<Option<Plan>> {
        Ok(self.state()?.plans.get(&plan_id).cloned())
    }

    async fn create_rollout(&self, plan: &Plan, stages: &[StageDraft]) -> CoreResult<Rollout> {
        let mut s = self.state()?;
        if s.rollouts.values().any(|r| r.plan_id == plan.id) {
            return Err(CoreError::Conflict(format!("plan {} already has a rollout", plan.id)));
        }
        let now = Utc::now();
        let rollout_id = s.next_id();
        let mut stage_ids = Vec::with_capacity(stages.len());

        for draft in stages {
            let stage_id = s.next_id();
            let mut task_ids = Vec::with_capacity(draft.tasks.len());
            for t in &draft.tasks {
                let task_id = s.next_id();
                s.tasks.insert(
                    task_id,
                    Task {
                        id: task_id,
                        rollout_id,
                        stage_id,
                        spec_id: t.spec_id.clone(),
                        kind: t.kind,
                        instance_id: t.instance_id.clone(),
                        database_name: t.database_name.clone(),
                        environment_id: t.environment_id.clone(),
                        sql: t.sql.clone(),
                        status: TaskStatus::NotStarted,
                        skipped_reason: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                task_ids.push(task_id);
            }
            s.stages.insert(
                stage_id,
                StageRow {
                    id: stage_id,
                    rollout_id,
                    environment_id: draft.environment_id.clone(),
                    position: draft.position,
                    task_ids,
                },
            );
            stage_ids.push(stage_id);
        }

        s.rollouts.insert(
            rollout_id,
            RolloutRow {
                id: rollout_id,
                project_id: plan.project_id.clone(),
                plan_id: plan.id,
                stage_ids,
                created_at: now,
            },
        );
        s.rollout(rollout_id)
            .ok_or_else(|| CoreError::Internal("rollout vanished after insert".into()))
    }

    async fn get_rollout(&self, rollout_id: DbId) -> CoreResult<Option<Rollout>> {
        Ok(self.state()?.rollout(rollout_id))
    }

    async fn get_rollout_by_plan(&self, plan_id: DbId) -> CoreResult<Option<Rollout>> {
        let s = self.state()?;
        let id = s.rollouts.values().find(|r| r.plan_id == plan_id).map(|r| r.id);
        Ok(id.and_then(|id| s.rollout(id)))
    }

    async fn get_stage(&self, stage_id: DbId) -> CoreResult<Option<Stage>> {
        Ok(self.state()?.stage(stage_id))
    }

    async fn get_task(&self, task_id: DbId) -> CoreResult<Option<Task>> {
        Ok(self.state()?.tasks.get(&task_id).cloned())
    }

    async fn claim_task_run(
        &self,
        task_id: DbId,
        allowed_from: &[TaskStatus],
        creator: &str,
    ) -> CoreResult<RunClaim> {
        let mut s = self.state()?;
        let status = s
            .tasks
            .get(&task_id)
            .map(|t| t.status)
            .ok_or_else(|| CoreError::not_found("task", task_id))?;

        if status.is_active() {
            return Ok(RunClaim::Active(status));
        }
        if !allowed_from.contains(&status) {
            return Ok(RunClaim::Ineligible(status));
        }

        s.set_task_status(task_id, TaskStatus::Pending)?;
        if let Some(task) = s.tasks.get_mut(&task_id) {
            task.skipped_reason = None;
        }
        let attempt = s.runs.values().filter(|r| r.task_id == task_id).count() as i32 + 1;
        let run = TaskRun {
            id: s.next_id(),
            task_id,
            attempt,
            status: TaskRunStatus::Pending,
            creator: creator.to_string(),
            results: Vec::new(),
            detail: String::new(),
            cancel_requested: false,
            worker_id: None,
            lease_expires_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        s.runs.insert(run.id, run.clone());
        Ok(RunClaim::Created(run))
    }

    async fn claim_pending_task_run(&self, lease: &Lease) -> CoreResult<Option<(TaskRun, Task)>> {
        let mut s = self.state()?;
        let Some(run_id) = s
            .runs
            .values()
            .find(|r| r.status == TaskRunStatus::Pending)
            .map(|r| r.id)
        else {
            return Ok(None);
        };

        let task_id = {
            let run = s
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| CoreError::not_found("task run", run_id))?;
            let now = Utc::now();
            run.status = TaskRunStatus::Running;
            run.started_at = Some(now);
            run.worker_id = Some(lease.worker_id.clone());
            run.lease_expires_at = Some(lease.expires_at(now));
            run.task_id
        };
        s.set_task_status(task_id, TaskStatus::Running)?;

        let run = s.runs.get(&run_id).cloned();
        let task = s.tasks.get(&task_id).cloned();
        Ok(run.zip(task))
    }

    async fn renew_task_run_lease(&self, task_run_id: DbId, lease: &Lease) -> CoreResult<bool> {
        let mut s = self.state()?;
        let Some(run) = s.runs.get_mut(&task_run_id) else {
            return Ok(false);
        };
        if run.status != TaskRunStatus::Running || run.worker_id.as_deref() != Some(lease.worker_id.as_str()) {
            return Ok(false);
        }
        run.lease_expires_at = Some(lease.expires_at(Utc::now()));
        Ok(true)
    }

    async fn finish_task_run(
        &self,
        task_run_id: DbId,
        worker_id: &str,
        status: TaskRunStatus,
        results: &[QueryResult],
        detail: &str,
    ) -> CoreResult<TaskRun> {
        let mut s = self.state()?;
        let run = s
            .runs
            .get_mut(&task_run_id)
            .ok_or_else(|| CoreError::not_found("task run", task_run_id))?;
        if run.status != TaskRunStatus::Running || !status.is_terminal() {
            return Err(CoreError::FailedPrecondition(format!(
                "cannot finish task run {task_run_id} from {} to {status}",
                run.status
            )));
        }
        if run.worker_id.as_deref() != Some(worker_id) {
            return Err(CoreError::Conflict(format!(
                "task run {task_run_id} is not held by worker {worker_id}"
            )));
        }
        run.status = status;
        run.results = results.to_vec();
        run.detail = detail.to_string();
        run.finished_at = Some(Utc::now());
        let run = run.clone();
        s.set_task_status(run.task_id, status.task_status())?;
        Ok(run)
    }

    async fn skip_task(&self, task_id: DbId, reason: &str) -> CoreResult<bool> {
        let mut s = self.state()?;
        let status = s
            .tasks
            .get(&task_id)
            .map(|t| t.status)
            .ok_or_else(|| CoreError::not_found("task", task_id))?;
        if !state_machine::skip_sources().contains(&status) {
            return Ok(false);
        }

        let now = Utc::now();
        for run in s
            .runs
            .values_mut()
            .filter(|r| r.task_id == task_id && r.status == TaskRunStatus::Pending)
        {
            run.status = TaskRunStatus::Canceled;
            run.detail = format!("task skipped: {reason}");
            run.finished_at = Some(now);
        }
        s.set_task_status(task_id, TaskStatus::Skipped)?;
        if let Some(task) = s.tasks.get_mut(&task_id) {
            task.skipped_reason = Some(reason.to_string());
        }
        Ok(true)
    }

    async fn request_cancel(&self, task_run_id: DbId) -> CoreResult<CancelOutcome> {
        let mut s = self.state()?;
        let run = s
            .runs
            .get_mut(&task_run_id)
            .ok_or_else(|| CoreError::not_found("task run", task_run_id))?;

        match run.status {
            TaskRunStatus::Pending => {
                run.status = TaskRunStatus::Canceled;
                run.finished_at = Some(Utc::now());
                run.detail = "canceled before start".into();
                let task_id = run.task_id;
                s.set_task_status(task_id, TaskStatus::Canceled)?;
                Ok(CancelOutcome::Canceled)
            }
            TaskRunStatus::Running => {
                run.cancel_requested = true;
                Ok(CancelOutcome::Requested)
            }
            other => Err(CoreError::FailedPrecondition(format!(
                "task run {task_run_id} is already {other}"
            ))),
        }
    }

    async fn is_cancel_requested(&self, task_run_id: DbId) -> CoreResult<bool> {
        Ok(self
            .state()?
            .runs
            .get(&task_run_id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false))
    }

    async fn get_task_run(&self, task_run_id: DbId) -> CoreResult<Option<TaskRun>> {
        Ok(self.state()?.runs.get(&task_run_id).cloned())
    }

    async fn list_task_runs(&self, task_id: DbId) -> CoreResult<Vec<TaskRun>> {
        // Ids are allocated monotonically, so id order is creation order.
        Ok(self
            .state()?
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn requeue_expired_task_runs(&self) -> CoreResult<u64> {
        let mut s = self.state()?;
        let now = Utc::now();
        let interrupted: Vec<(DbId, DbId)> = s
            .runs
            .values()
            .filter(|r| r.status == TaskRunStatus::Running && r.lease_expires_at.map_or(true, |at| at < now))
            .map(|r| (r.id, r.task_id))
            .collect();
        for (run_id, task_id) in &interrupted {
            if let Some(run) = s.runs.get_mut(run_id) {
                run.status = TaskRunStatus::Pending;
                run.started_at = None;
                run.worker_id = None;
                run.lease_expires_at = None;
            }
            if let Some(task) = s.tasks.get_mut(task_id) {
                task.status = TaskStatus::Pending;
                task.updated_at = Utc::now();
            }
        }
        Ok(interrupted.len() as u64)
    }
}

#[async_trait]
impl IssueStore for MemoryStore {
    async fn create_issue(&self, project_id: &str, input: &CreateIssue) -> CoreResult<Issue> {
        let mut s = self.state()?;
        if !s.plans.contains_key(&input.plan_id) {
            return Err(CoreError::not_found("plan", input.plan_id));
        }
        if s.issues.values().any(|i| i.plan_id == input.plan_id) {
            return Err(CoreError::Conflict(format!(
                "plan {} already has an issue",
                input.plan_id
            )));
        }
        let now = Utc::now();
        let issue = Issue {
            id: s.next_id(),
            project_id: project_id.to_string(),
            plan_id: input.plan_id,
            title: input.title.clone(),
            status: IssueStatus::Open,
            creator: input.creator.clone().unwrap_or_default(),
            approval: ApprovalFinding::default(),
            created_at: now,
            updated_at: now,
        };
        s.issues.insert(issue.id, issue.clone());
        Ok(issue)
    }

    async fn get_issue(&self, issue_id: DbId) -> CoreResult<Option<Issue>> {
        Ok(self.state()?.issues.get(&issue_id).cloned())
    }

    async fn get_issue_by_plan(&self, plan_id: DbId) -> CoreResult<Option<Issue>> {
        Ok(self
            .state()?
            .issues
            .values()
            .find(|i| i.plan_id == plan_id)
            .cloned())
    }

    async fn list_issues_awaiting_approval_finding(&self) -> CoreResult<Vec<Issue>> {
        Ok(self
            .state()?
            .issues
            .values()
            .filter(|i| i.status == IssueStatus::Open && !i.approval.done)
            .cloned()
            .collect())
    }

    async fn complete_approval_finding(&self, issue_id: DbId, finding: &ApprovalFinding) -> CoreResult<bool> {
        let mut s = self.state()?;
        let issue = s
            .issues
            .get_mut(&issue_id)
            .ok_or_else(|| CoreError::not_found("issue", issue_id))?;
        if issue.approval.done {
            return Ok(false);
        }
        issue.approval = finding.clone();
        issue.approval.done = true;
        issue.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_approval(
        &self,
        issue_id: DbId,
        expected: &ApprovalFinding,
        finding: &ApprovalFinding,
    ) -> CoreResult<Issue> {
        let mut s = self.state()?;
        let issue = s
            .issues
            .get_mut(&issue_id)
            .ok_or_else(|| CoreError::not_found("issue", issue_id))?;
        if !issue.approval.done {
            return Err(CoreError::FailedPrecondition(format!(
                "issue {issue_id} approval finding is not done"
            )));
        }
        if issue.approval != *expected {
            return Err(CoreError::Conflict(format!(
                "issue {issue_id} approval changed concurrently, reload and retry"
            )));
        }
        issue.approval = finding.clone();
        issue.updated_at = Utc::now();
        Ok(issue.clone())
    }
}
