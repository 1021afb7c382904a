//! Inventory types: instances, databases, deployment configs, database groups.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::expr::Expression;
use crate::resource_name::{environment_name, DatabaseGroupName, DatabaseName};
use crate::types::Timestamp;

/// Database engine of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Engine {
    Postgres,
    Mysql,
    Tidb,
    Sqlite,
    Mssql,
    Oracle,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Postgres => "POSTGRES",
            Engine::Mysql => "MYSQL",
            Engine::Tidb => "TIDB",
            Engine::Sqlite => "SQLITE",
            Engine::Mssql => "MSSQL",
            Engine::Oracle => "ORACLE",
        }
    }
}

impl std::str::FromStr for Engine {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POSTGRES" => Ok(Engine::Postgres),
            "MYSQL" => Ok(Engine::Mysql),
            "TIDB" => Ok(Engine::Tidb),
            "SQLITE" => Ok(Engine::Sqlite),
            "MSSQL" => Ok(Engine::Mssql),
            "ORACLE" => Ok(Engine::Oracle),
            other => Err(CoreError::Validation(format!("unknown engine '{other}'"))),
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered database server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Resource id, e.g. `pg-prod` in `instances/pg-prod`.
    pub id: String,
    pub title: String,
    pub engine: Engine,
    pub environment_id: String,
    /// Connection URL for the target server. Never serialized back to clients.
    #[serde(skip_serializing, default)]
    pub data_source_url: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstance {
    pub id: String,
    pub title: Option<String>,
    pub engine: Engine,
    pub environment_id: String,
    pub data_source_url: String,
}

/// A database on an instance, assigned to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub instance_id: String,
    pub name: String,
    pub project_id: String,
    /// Effective environment: the database override, else the instance's.
    pub environment_id: String,
    pub engine: Engine,
}

impl Database {
    pub fn resource_name(&self) -> DatabaseName {
        DatabaseName {
            instance_id: self.instance_id.clone(),
            database_name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDatabase {
    pub name: String,
    pub project_id: String,
    /// Overrides the instance environment when set.
    pub environment_id: Option<String>,
}

/// Ordered deployment pipeline of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub project_id: String,
    /// Environment ids in rollout order.
    pub environments: Vec<String>,
}

impl DeploymentConfig {
    /// Position of `environment_id` in the pipeline, if present.
    pub fn stage_index(&self, environment_id: &str) -> Option<usize> {
        self.environments.iter().position(|e| e == environment_id)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.environments.is_empty() {
            return Err(CoreError::Validation(
                "deployment config must list at least one environment".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for env in &self.environments {
            if env.trim().is_empty() {
                return Err(CoreError::Validation("environment id must not be empty".into()));
            }
            if !seen.insert(env.as_str()) {
                return Err(CoreError::Validation(format!(
                    "environment '{}' appears twice in deployment config",
                    environment_name(env)
                )));
            }
        }
        Ok(())
    }
}

/// Attributes a database group expression may reference.
pub const GROUP_ATTRIBUTES: &[&str] = &[
    "environment_name",
    "database_name",
    "instance_id",
    "resource.environment_name",
    "resource.database_name",
    "resource.instance_id",
];

/// A dynamically resolved set of databases within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseGroup {
    pub project_id: String,
    pub group_id: String,
    pub title: String,
    pub expression: String,
    pub created_at: Timestamp,
}

impl DatabaseGroup {
    pub fn resource_name(&self) -> DatabaseGroupName {
        DatabaseGroupName {
            project_id: self.project_id.clone(),
            group_id: self.group_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDatabaseGroup {
    pub group_id: String,
    pub title: Option<String>,
    pub expression: String,
}

/// Parse a group expression and check it only reads group attributes.
pub fn validate_group_expression(source: &str) -> Result<Expression, CoreError> {
    let expr = Expression::parse(source)?;
    if let Some(unknown) = expr
        .referenced_attributes()
        .into_iter()
        .find(|a| !GROUP_ATTRIBUTES.contains(&a.as_str()))
    {
        return Err(CoreError::Validation(format!(
            "database group expression references unsupported attribute '{unknown}'"
        )));
    }
    Ok(expr)
}
