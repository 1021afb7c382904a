//! Handlers for the inventory: instances, databases, deployment configs and
//! database groups.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use rollgate_core::catalog::{
    validate_group_expression, CreateDatabase, CreateDatabaseGroup, CreateInstance, DatabaseGroup,
    DeploymentConfig,
};
use rollgate_core::database_group::{self, MatchDiagnostic};
use rollgate_core::error::CoreError;
use rollgate_core::store::DatabaseFilter;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Body of `PUT /projects/{project}/deployment-config`.
#[derive(Debug, Deserialize)]
pub struct UpdateDeploymentConfig {
    pub environments: Vec<String>,
}

/// A database group with its current membership.
#[derive(Debug, Serialize)]
pub struct DatabaseGroupView {
    #[serde(flatten)]
    pub group: DatabaseGroup,
    pub name: String,
    /// Resource names of matching databases.
    pub matched: Vec<String>,
    pub unmatched: Vec<String>,
    pub diagnostics: Vec<MatchDiagnostic>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// POST /api/v1/instances
pub async fn create_instance(
    State(state): State<AppState>,
    Json(input): Json<CreateInstance>,
) -> AppResult<impl IntoResponse> {
    if input.id.trim().is_empty() || input.id.contains('/') {
        return Err(AppError::BadRequest(format!("invalid instance id '{}'", input.id)));
    }
    if input.environment_id.trim().is_empty() {
        return Err(AppError::BadRequest("environment_id must not be empty".into()));
    }

    let instance = state.store.create_instance(&input).await?;

    tracing::info!(
        instance_id = %instance.id,
        engine = %instance.engine,
        environment_id = %instance.environment_id,
        "Instance registered"
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: instance })))
}

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let instances = state.store.list_instances().await?;
    Ok(Json(DataResponse { data: instances }))
}

/// GET /api/v1/instances/{instance}
pub async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let instance = state
        .store
        .get_instance(&instance_id)
        .await?
        .ok_or_else(|| CoreError::not_found("Instance", &instance_id))?;
    Ok(Json(DataResponse { data: instance }))
}

// ---------------------------------------------------------------------------
// Databases
// ---------------------------------------------------------------------------

/// POST /api/v1/instances/{instance}/databases
pub async fn create_database(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(input): Json<CreateDatabase>,
) -> AppResult<impl IntoResponse> {
    if input.name.trim().is_empty() || input.project_id.trim().is_empty() {
        return Err(AppError::BadRequest("name and project_id are required".into()));
    }

    let database = state.store.create_database(&instance_id, &input).await?;

    tracing::info!(
        database = %database.resource_name(),
        project_id = %database.project_id,
        "Database registered"
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: database })))
}

/// GET /api/v1/instances/{instance}/databases
pub async fn list_instance_databases(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state
        .store
        .get_instance(&instance_id)
        .await?
        .ok_or_else(|| CoreError::not_found("Instance", &instance_id))?;

    let filter = DatabaseFilter {
        instance_id: Some(instance_id),
        ..Default::default()
    };
    let databases = state.store.list_databases(&filter).await?;
    Ok(Json(DataResponse { data: databases }))
}

/// GET /api/v1/projects/{project}/databases
pub async fn list_project_databases(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let filter = DatabaseFilter {
        project_id: Some(project_id),
        ..Default::default()
    };
    let databases = state.store.list_databases(&filter).await?;
    Ok(Json(DataResponse { data: databases }))
}

// ---------------------------------------------------------------------------
// Deployment config
// ---------------------------------------------------------------------------

/// GET /api/v1/projects/{project}/deployment-config
pub async fn get_deployment_config(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let config = state
        .store
        .get_deployment_config(&project_id)
        .await?
        .ok_or_else(|| CoreError::not_found("DeploymentConfig", &project_id))?;
    Ok(Json(DataResponse { data: config }))
}

/// PUT /api/v1/projects/{project}/deployment-config
///
/// Replaces the project's environment pipeline. Existing rollouts keep the
/// stages they were compiled with.
pub async fn put_deployment_config(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(input): Json<UpdateDeploymentConfig>,
) -> AppResult<impl IntoResponse> {
    let config = DeploymentConfig {
        project_id,
        environments: input.environments,
    };
    config.validate()?;

    let saved = state.store.upsert_deployment_config(&config).await?;

    tracing::info!(
        project_id = %saved.project_id,
        environments = ?saved.environments,
        "Deployment config updated"
    );

    Ok(Json(DataResponse { data: saved }))
}

// ---------------------------------------------------------------------------
// Database groups
// ---------------------------------------------------------------------------

/// POST /api/v1/projects/{project}/database-groups
pub async fn create_database_group(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(input): Json<CreateDatabaseGroup>,
) -> AppResult<impl IntoResponse> {
    if input.group_id.trim().is_empty() || input.group_id.contains('/') {
        return Err(AppError::BadRequest(format!("invalid group id '{}'", input.group_id)));
    }
    validate_group_expression(&input.expression)?;

    let group = state.store.create_database_group(&project_id, &input).await?;

    tracing::info!(
        group = %group.resource_name(),
        expression = %group.expression,
        "Database group created"
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: group })))
}

/// GET /api/v1/projects/{project}/database-groups
pub async fn list_database_groups(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let groups = state.store.list_database_groups(&project_id).await?;
    Ok(Json(DataResponse { data: groups }))
}

/// GET /api/v1/projects/{project}/database-groups/{group}
///
/// Resolves the group against the project's databases at request time.
pub async fn get_database_group(
    State(state): State<AppState>,
    Path((project_id, group_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let group = state
        .store
        .get_database_group(&project_id, &group_id)
        .await?
        .ok_or_else(|| CoreError::not_found("DatabaseGroup", &group_id))?;

    let expr = validate_group_expression(&group.expression)?;
    let filter = DatabaseFilter {
        project_id: Some(project_id),
        ..Default::default()
    };
    let candidates = state.store.list_databases(&filter).await?;
    let partition = database_group::resolve(&expr, candidates);

    let names = |dbs: &[rollgate_core::catalog::Database]| {
        dbs.iter()
            .map(|db| db.resource_name().to_string())
            .collect::<Vec<_>>()
    };

    let view = DatabaseGroupView {
        name: group.resource_name().to_string(),
        matched: names(&partition.matched),
        unmatched: names(&partition.unmatched),
        diagnostics: partition.diagnostics,
        group,
    };
    Ok(Json(DataResponse { data: view }))
}
