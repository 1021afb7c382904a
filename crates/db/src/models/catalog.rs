//! Rows of `instances`, `databases`, `deployment_configs` and
//! `database_groups`.

use rollgate_core::catalog::{Database, DatabaseGroup, DeploymentConfig, Engine, Instance};
use rollgate_core::error::CoreError;
use rollgate_core::types::Timestamp;
use sqlx::FromRow;

use super::corrupt;

#[derive(Debug, Clone, FromRow)]
pub struct InstanceRow {
    pub id: String,
    pub title: String,
    pub engine: String,
    pub environment_id: String,
    pub data_source_url: String,
    pub created_at: Timestamp,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = CoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let engine: Engine = row
            .engine
            .parse()
            .map_err(|_| corrupt("instances", "engine", &row.engine))?;
        Ok(Instance {
            id: row.id,
            title: row.title,
            engine,
            environment_id: row.environment_id,
            data_source_url: row.data_source_url,
            created_at: row.created_at,
        })
    }
}

/// A `databases` row joined with its instance's engine.
#[derive(Debug, Clone, FromRow)]
pub struct DatabaseRow {
    pub instance_id: String,
    pub name: String,
    pub project_id: String,
    pub environment_id: String,
    pub engine: String,
}

impl TryFrom<DatabaseRow> for Database {
    type Error = CoreError;

    fn try_from(row: DatabaseRow) -> Result<Self, Self::Error> {
        let engine: Engine = row
            .engine
            .parse()
            .map_err(|_| corrupt("instances", "engine", &row.engine))?;
        Ok(Database {
            instance_id: row.instance_id,
            name: row.name,
            project_id: row.project_id,
            environment_id: row.environment_id,
            engine,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DeploymentConfigRow {
    pub project_id: String,
    pub environments: Vec<String>,
}

impl From<DeploymentConfigRow> for DeploymentConfig {
    fn from(row: DeploymentConfigRow) -> Self {
        DeploymentConfig {
            project_id: row.project_id,
            environments: row.environments,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DatabaseGroupRow {
    pub project_id: String,
    pub group_id: String,
    pub title: String,
    pub expression: String,
    pub created_at: Timestamp,
}

impl From<DatabaseGroupRow> for DatabaseGroup {
    fn from(row: DatabaseGroupRow) -> Self {
        DatabaseGroup {
            project_id: row.project_id,
            group_id: row.group_id,
            title: row.title,
            expression: row.expression,
            created_at: row.created_at,
        }
    }
}
