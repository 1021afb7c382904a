//! Plans, rollouts, stages, tasks and task runs, plus the pure plan to
//! rollout compilation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::catalog::{Database, DatabaseGroup, DeploymentConfig, Instance};
use crate::database_group;
use crate::error::{CoreError, CoreResult};
use crate::executor::QueryResult;
use crate::expr::Expression;
use crate::resource_name::{environment_name, parse_instance, DatabaseGroupName, DatabaseName};
use crate::risk::RiskSource;
use crate::status::{TaskRunStatus, TaskStatus};
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    SchemaMigration,
    DataChange,
    DatabaseCreate,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::SchemaMigration => "SCHEMA_MIGRATION",
            ChangeKind::DataChange => "DATA_CHANGE",
            ChangeKind::DatabaseCreate => "DATABASE_CREATE",
        }
    }

    pub fn risk_source(self) -> RiskSource {
        match self {
            ChangeKind::SchemaMigration => RiskSource::Ddl,
            ChangeKind::DataChange => RiskSource::Dml,
            ChangeKind::DatabaseCreate => RiskSource::CreateDatabase,
        }
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEMA_MIGRATION" => Ok(ChangeKind::SchemaMigration),
            "DATA_CHANGE" => Ok(ChangeKind::DataChange),
            "DATABASE_CREATE" => Ok(ChangeKind::DatabaseCreate),
            other => Err(CoreError::Validation(format!("unknown change kind '{other}'"))),
        }
    }
}

/// Where a spec applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    /// Explicit `instances/{i}/databases/{d}` names.
    Databases { databases: Vec<String> },
    /// `projects/{p}/databaseGroups/{g}`, resolved at compilation time.
    DatabaseGroup { group: String },
    /// A new database on `instances/{i}`.
    CreateDatabase {
        instance: String,
        database_name: String,
        #[serde(default)]
        environment_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    pub kind: ChangeKind,
    pub target: Target,
    #[serde(default)]
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: DbId,
    pub project_id: String,
    pub title: String,
    pub specs: Vec<Spec>,
    pub creator: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlan {
    pub title: String,
    pub specs: Vec<Spec>,
    #[serde(default)]
    pub creator: Option<String>,
}

impl CreatePlan {
    /// Structural validation; inventory checks happen at compilation.
    pub fn validate(&self, project_id: &str) -> CoreResult<()> {
        if self.specs.is_empty() {
            return Err(CoreError::Validation("plan must contain at least one spec".into()));
        }
        let mut ids = HashSet::new();
        for spec in &self.specs {
            if spec.id.trim().is_empty() {
                return Err(CoreError::Validation("spec id must not be empty".into()));
            }
            if !ids.insert(spec.id.as_str()) {
                return Err(CoreError::Validation(format!("duplicate spec id '{}'", spec.id)));
            }
            validate_spec(spec, project_id)?;
        }
        Ok(())
    }
}

fn validate_spec(spec: &Spec, project_id: &str) -> CoreResult<()> {
    let invalid = |msg: String| CoreError::Validation(format!("spec '{}': {msg}", spec.id));

    match (&spec.target, spec.kind) {
        (Target::CreateDatabase { .. }, ChangeKind::DatabaseCreate) => {}
        (Target::CreateDatabase { .. }, kind) | (_, kind @ ChangeKind::DatabaseCreate) => {
            return Err(invalid(format!(
                "{} requires a create-database target and vice versa",
                kind.as_str()
            )));
        }
        _ => {}
    }

    match &spec.target {
        Target::Databases { databases } => {
            if databases.is_empty() {
                return Err(invalid("no target databases".into()));
            }
            for name in databases {
                DatabaseName::parse(name).map_err(|e| invalid(e.to_string()))?;
            }
        }
        Target::DatabaseGroup { group } => {
            let name = DatabaseGroupName::parse(group).map_err(|e| invalid(e.to_string()))?;
            if name.project_id != project_id {
                return Err(invalid(format!("group {group} belongs to another project")));
            }
        }
        Target::CreateDatabase {
            instance,
            database_name,
            ..
        } => {
            parse_instance(instance).map_err(|e| invalid(e.to_string()))?;
            if database_name.trim().is_empty() {
                return Err(invalid("database name must not be empty".into()));
            }
        }
    }

    if spec.kind != ChangeKind::DatabaseCreate && spec.sql.trim().is_empty() {
        return Err(invalid("sql must not be empty".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rollout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub id: DbId,
    pub project_id: String,
    pub plan_id: DbId,
    pub stages: Vec<Stage>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: DbId,
    pub rollout_id: DbId,
    pub environment_id: String,
    /// Zero-based position in the deployment pipeline.
    pub position: i32,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: DbId,
    pub rollout_id: DbId,
    pub stage_id: DbId,
    pub spec_id: String,
    pub kind: ChangeKind,
    pub instance_id: String,
    pub database_name: String,
    pub environment_id: String,
    pub sql: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: DbId,
    pub task_id: DbId,
    /// 1-based attempt number within the task.
    pub attempt: i32,
    pub status: TaskRunStatus,
    pub creator: String,
    pub results: Vec<QueryResult>,
    /// Terminal error, empty on success.
    pub detail: String,
    pub cancel_requested: bool,
    /// Worker executing the run, set while `Running`.
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// A task before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDraft {
    pub spec_id: String,
    pub kind: ChangeKind,
    pub instance_id: String,
    pub database_name: String,
    pub environment_id: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDraft {
    pub environment_id: String,
    pub position: i32,
    pub tasks: Vec<TaskDraft>,
}

/// Inventory a plan is compiled against.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub instances: Vec<Instance>,
    /// Databases of the plan's project.
    pub databases: Vec<Database>,
    pub groups: Vec<DatabaseGroup>,
}

/// Compile `plan` into ordered stage drafts.
///
/// Stages follow the deployment config; tasks within a stage follow spec
/// order then database name. Duplicate (spec, database) pairs
/// are collapsed.
pub fn compile_rollout(
    plan: &Plan,
    config: &DeploymentConfig,
    inventory: &Inventory,
) -> CoreResult<Vec<StageDraft>> {
    // stage position -> (spec index, database, instance) -> draft
    let mut stages: BTreeMap<usize, BTreeMap<(usize, String, String), TaskDraft>> = BTreeMap::new();

    for (spec_index, spec) in plan.specs.iter().enumerate() {
        for (instance_id, database_name, environment_id) in resolve_targets(plan, spec, config, inventory)? {
            let position = config.stage_index(&environment_id).ok_or_else(|| {
                CoreError::Validation(format!(
                    "{} of database {instance_id}/{database_name} is not in the deployment config",
                    environment_name(&environment_id)
                ))
            })?;
            stages.entry(position).or_default().insert(
                (spec_index, database_name.clone(), instance_id.clone()),
                TaskDraft {
                    spec_id: spec.id.clone(),
                    kind: spec.kind,
                    instance_id,
                    database_name,
                    environment_id,
                    sql: spec.sql.clone(),
                },
            );
        }
    }

    if stages.is_empty() {
        return Err(CoreError::Validation("plan has no stage created".into()));
    }

    Ok(stages
        .into_iter()
        .map(|(position, tasks)| {
            let tasks: Vec<TaskDraft> = tasks.into_values().collect();
            StageDraft {
                environment_id: config.environments[position].clone(),
                position: position as i32,
                tasks,
            }
        })
        .collect())
}

/// `(instance, database, environment)` for every target of `spec`.
fn resolve_targets(
    plan: &Plan,
    spec: &Spec,
    config: &DeploymentConfig,
    inventory: &Inventory,
) -> CoreResult<Vec<(String, String, String)>> {
    match &spec.target {
        Target::Databases { databases } => databases
            .iter()
            .map(|raw| {
                let name = DatabaseName::parse(raw)?;
                let db = inventory
                    .databases
                    .iter()
                    .find(|d| d.instance_id == name.instance_id && d.name == name.database_name)
                    .ok_or_else(|| {
                        CoreError::Validation(format!(
                            "database {raw} not found in project {}",
                            plan.project_id
                        ))
                    })?;
                Ok((db.instance_id.clone(), db.name.clone(), db.environment_id.clone()))
            })
            .collect(),
        Target::DatabaseGroup { group } => {
            let name = DatabaseGroupName::parse(group)?;
            let group = inventory
                .groups
                .iter()
                .find(|g| g.project_id == name.project_id && g.group_id == name.group_id)
                .ok_or_else(|| CoreError::Validation(format!("database group {group} not found")))?;
            let expr = Expression::parse(&group.expression)?;
            let in_pipeline: BTreeSet<&str> = config.environments.iter().map(String::as_str).collect();
            let candidates = inventory
                .databases
                .iter()
                .filter(|d| d.project_id == plan.project_id && in_pipeline.contains(d.environment_id.as_str()))
                .cloned();
            let matched = database_group::resolve(&expr, candidates).matched;
            Ok(matched
                .into_iter()
                .map(|d| (d.instance_id, d.name, d.environment_id))
                .collect())
        }
        Target::CreateDatabase {
            instance,
            database_name,
            environment_id,
        } => {
            let instance_id = parse_instance(instance)?;
            let instance = inventory
                .instances
                .iter()
                .find(|i| i.id == instance_id)
                .ok_or_else(|| CoreError::Validation(format!("instance {instance} not found")))?;
            if inventory
                .databases
                .iter()
                .any(|d| d.instance_id == instance.id && d.name == *database_name)
            {
                return Err(CoreError::Validation(format!(
                    "database {database_name} already exists on instances/{}",
                    instance.id
                )));
            }
            let environment = environment_id.clone().unwrap_or_else(|| instance.environment_id.clone());
            Ok(vec![(instance.id.clone(), database_name.clone(), environment)])
        }
    }
}
