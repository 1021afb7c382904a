//! Repositories for the inventory tables.

use rollgate_core::catalog::{CreateDatabase, CreateDatabaseGroup, CreateInstance, DeploymentConfig};
use sqlx::PgPool;

use crate::models::catalog::{DatabaseGroupRow, DatabaseRow, DeploymentConfigRow, InstanceRow};

const INSTANCE_COLUMNS: &str = "id, title, engine, environment_id, data_source_url, created_at";

/// Database columns with the engine pulled from the owning instance.
const DATABASE_COLUMNS: &str = "d.instance_id, d.name, d.project_id, d.environment_id, i.engine";

const GROUP_COLUMNS: &str = "project_id, group_id, title, expression, created_at";

pub struct InstanceRepo;

impl InstanceRepo {
    pub async fn create(pool: &PgPool, input: &CreateInstance) -> Result<InstanceRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO instances (id, title, engine, environment_id, data_source_url)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {INSTANCE_COLUMNS}"
        );
        sqlx::query_as::<_, InstanceRow>(&query)
            .bind(&input.id)
            .bind(input.title.as_deref().unwrap_or(&input.id))
            .bind(input.engine.as_str())
            .bind(&input.environment_id)
            .bind(&input.data_source_url)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<InstanceRow>, sqlx::Error> {
        let query = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = $1");
        sqlx::query_as::<_, InstanceRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<InstanceRow>, sqlx::Error> {
        let query = format!("SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY id");
        sqlx::query_as::<_, InstanceRow>(&query).fetch_all(pool).await
    }
}

pub struct DatabaseRepo;

impl DatabaseRepo {
    /// Register a database. The environment defaults to the instance's.
    /// Returns `None` if the instance does not exist.
    pub async fn create(
        pool: &PgPool,
        instance_id: &str,
        input: &CreateDatabase,
    ) -> Result<Option<DatabaseRow>, sqlx::Error> {
        let query = format!(
            "WITH inserted AS (
                 INSERT INTO databases (instance_id, name, project_id, environment_id)
                 SELECT i.id, $2, $3, COALESCE($4, i.environment_id)
                 FROM instances i WHERE i.id = $1
                 RETURNING instance_id, name, project_id, environment_id
             )
             SELECT {DATABASE_COLUMNS}
             FROM inserted d JOIN instances i ON i.id = d.instance_id"
        );
        sqlx::query_as::<_, DatabaseRow>(&query)
            .bind(instance_id)
            .bind(&input.name)
            .bind(&input.project_id)
            .bind(input.environment_id.as_deref())
            .fetch_optional(pool)
            .await
    }

    /// List databases, optionally narrowed by project and instance.
    pub async fn list(
        pool: &PgPool,
        project_id: Option<&str>,
        instance_id: Option<&str>,
    ) -> Result<Vec<DatabaseRow>, sqlx::Error> {
        let query = format!(
            "SELECT {DATABASE_COLUMNS}
             FROM databases d JOIN instances i ON i.id = d.instance_id
             WHERE ($1::TEXT IS NULL OR d.project_id = $1)
               AND ($2::TEXT IS NULL OR d.instance_id = $2)
             ORDER BY d.instance_id, d.name"
        );
        sqlx::query_as::<_, DatabaseRow>(&query)
            .bind(project_id)
            .bind(instance_id)
            .fetch_all(pool)
            .await
    }
}

pub struct DeploymentConfigRepo;

impl DeploymentConfigRepo {
    pub async fn find(pool: &PgPool, project_id: &str) -> Result<Option<DeploymentConfigRow>, sqlx::Error> {
        sqlx::query_as::<_, DeploymentConfigRow>(
            "SELECT project_id, environments FROM deployment_configs WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn upsert(pool: &PgPool, config: &DeploymentConfig) -> Result<DeploymentConfigRow, sqlx::Error> {
        sqlx::query_as::<_, DeploymentConfigRow>(
            "INSERT INTO deployment_configs (project_id, environments)
             VALUES ($1, $2)
             ON CONFLICT (project_id)
             DO UPDATE SET environments = EXCLUDED.environments, updated_at = NOW()
             RETURNING project_id, environments",
        )
        .bind(&config.project_id)
        .bind(&config.environments)
        .fetch_one(pool)
        .await
    }
}

pub struct DatabaseGroupRepo;

impl DatabaseGroupRepo {
    pub async fn create(
        pool: &PgPool,
        project_id: &str,
        input: &CreateDatabaseGroup,
    ) -> Result<DatabaseGroupRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO database_groups (project_id, group_id, title, expression)
             VALUES ($1, $2, $3, $4)
             RETURNING {GROUP_COLUMNS}"
        );
        sqlx::query_as::<_, DatabaseGroupRow>(&query)
            .bind(project_id)
            .bind(&input.group_id)
            .bind(input.title.as_deref().unwrap_or(&input.group_id))
            .bind(&input.expression)
            .fetch_one(pool)
            .await
    }

    pub async fn find(
        pool: &PgPool,
        project_id: &str,
        group_id: &str,
    ) -> Result<Option<DatabaseGroupRow>, sqlx::Error> {
        let query = format!(
            "SELECT {GROUP_COLUMNS} FROM database_groups WHERE project_id = $1 AND group_id = $2"
        );
        sqlx::query_as::<_, DatabaseGroupRow>(&query)
            .bind(project_id)
            .bind(group_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_project(pool: &PgPool, project_id: &str) -> Result<Vec<DatabaseGroupRow>, sqlx::Error> {
        let query = format!(
            "SELECT {GROUP_COLUMNS} FROM database_groups WHERE project_id = $1 ORDER BY group_id"
        );
        sqlx::query_as::<_, DatabaseGroupRow>(&query)
            .bind(project_id)
            .fetch_all(pool)
            .await
    }
}
