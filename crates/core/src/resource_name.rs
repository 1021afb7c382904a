//! Hierarchical resource names, e.g.
//! `projects/{p}/rollouts/{id}/stages/{id}/tasks/{id}/taskRuns/{id}`.

use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::types::DbId;

pub const PROJECT_PREFIX: &str = "projects/";
pub const ENVIRONMENT_PREFIX: &str = "environments/";
pub const INSTANCE_PREFIX: &str = "instances/";

/// Split `name` into `key/value` pairs, checking the keys match `keys` in
/// order. Returns the values.
fn segments<'a>(name: &'a str, keys: &[&str]) -> CoreResult<Vec<&'a str>> {
    let parts: Vec<&str> = name.split('/').collect();
    let expected = keys
        .iter()
        .map(|k| format!("{k}/{{{k}}}"))
        .collect::<Vec<_>>()
        .join("/");
    let invalid = || CoreError::Validation(format!("invalid resource name '{name}', expected '{expected}'"));

    if parts.len() != keys.len() * 2 {
        return Err(invalid());
    }
    let mut values = Vec::with_capacity(keys.len());
    for (pair, key) in parts.chunks(2).zip(keys) {
        if pair[0] != *key || pair[1].is_empty() {
            return Err(invalid());
        }
        values.push(pair[1]);
    }
    Ok(values)
}

fn parse_id(name: &str, raw: &str) -> CoreResult<DbId> {
    raw.parse::<DbId>()
        .map_err(|_| CoreError::Validation(format!("invalid id '{raw}' in resource name '{name}'")))
}

/// `environments/{id}` -> `id`.
pub fn parse_environment(name: &str) -> CoreResult<String> {
    Ok(segments(name, &["environments"])?[0].to_string())
}

pub fn environment_name(environment_id: &str) -> String {
    format!("{ENVIRONMENT_PREFIX}{environment_id}")
}

/// `projects/{id}` -> `id`.
pub fn parse_project(name: &str) -> CoreResult<String> {
    Ok(segments(name, &["projects"])?[0].to_string())
}

/// `instances/{id}` -> `id`.
pub fn parse_instance(name: &str) -> CoreResult<String> {
    Ok(segments(name, &["instances"])?[0].to_string())
}

/// `instances/{instance}/databases/{database}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseName {
    pub instance_id: String,
    pub database_name: String,
}

impl DatabaseName {
    pub fn parse(name: &str) -> CoreResult<Self> {
        let v = segments(name, &["instances", "databases"])?;
        Ok(Self {
            instance_id: v[0].to_string(),
            database_name: v[1].to_string(),
        })
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instances/{}/databases/{}", self.instance_id, self.database_name)
    }
}

/// `projects/{project}/databaseGroups/{group}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseGroupName {
    pub project_id: String,
    pub group_id: String,
}

impl DatabaseGroupName {
    pub fn parse(name: &str) -> CoreResult<Self> {
        let v = segments(name, &["projects", "databaseGroups"])?;
        Ok(Self {
            project_id: v[0].to_string(),
            group_id: v[1].to_string(),
        })
    }
}

impl fmt::Display for DatabaseGroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/databaseGroups/{}", self.project_id, self.group_id)
    }
}

/// `projects/{project}/plans/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanName {
    pub project_id: String,
    pub plan_id: DbId,
}

impl PlanName {
    pub fn parse(name: &str) -> CoreResult<Self> {
        let v = segments(name, &["projects", "plans"])?;
        Ok(Self {
            project_id: v[0].to_string(),
            plan_id: parse_id(name, v[1])?,
        })
    }
}

impl fmt::Display for PlanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/plans/{}", self.project_id, self.plan_id)
    }
}

/// `projects/{project}/issues/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueName {
    pub project_id: String,
    pub issue_id: DbId,
}

impl IssueName {
    pub fn parse(name: &str) -> CoreResult<Self> {
        let v = segments(name, &["projects", "issues"])?;
        Ok(Self {
            project_id: v[0].to_string(),
            issue_id: parse_id(name, v[1])?,
        })
    }
}

impl fmt::Display for IssueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/issues/{}", self.project_id, self.issue_id)
    }
}

/// `projects/{project}/rollouts/{rollout}/stages/{stage}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageName {
    pub project_id: String,
    pub rollout_id: DbId,
    pub stage_id: DbId,
}

impl StageName {
    pub fn parse(name: &str) -> CoreResult<Self> {
        let v = segments(name, &["projects", "rollouts", "stages"])?;
        Ok(Self {
            project_id: v[0].to_string(),
            rollout_id: parse_id(name, v[1])?,
            stage_id: parse_id(name, v[2])?,
        })
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/rollouts/{}/stages/{}",
            self.project_id, self.rollout_id, self.stage_id
        )
    }
}

/// `projects/{project}/rollouts/{rollout}/stages/{stage}/tasks/{task}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskName {
    pub project_id: String,
    pub rollout_id: DbId,
    pub stage_id: DbId,
    pub task_id: DbId,
}

impl TaskName {
    pub fn parse(name: &str) -> CoreResult<Self> {
        let v = segments(name, &["projects", "rollouts", "stages", "tasks"])?;
        Ok(Self {
            project_id: v[0].to_string(),
            rollout_id: parse_id(name, v[1])?,
            stage_id: parse_id(name, v[2])?,
            task_id: parse_id(name, v[3])?,
        })
    }

    pub fn stage(&self) -> StageName {
        StageName {
            project_id: self.project_id.clone(),
            rollout_id: self.rollout_id,
            stage_id: self.stage_id,
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/tasks/{}", self.stage(), self.task_id)
    }
}

/// `.../tasks/{task}/taskRuns/{run}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunName {
    pub task: TaskName,
    pub task_run_id: DbId,
}

impl TaskRunName {
    pub fn parse(name: &str) -> CoreResult<Self> {
        let v = segments(name, &["projects", "rollouts", "stages", "tasks", "taskRuns"])?;
        Ok(Self {
            task: TaskName {
                project_id: v[0].to_string(),
                rollout_id: parse_id(name, v[1])?,
                stage_id: parse_id(name, v[2])?,
                task_id: parse_id(name, v[3])?,
            },
            task_run_id: parse_id(name, v[4])?,
        })
    }
}

impl fmt::Display for TaskRunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/taskRuns/{}", self.task, self.task_run_id)
    }
}
