//! Handlers for interactive queries, administrative execution and export.
//!
//! Both execution paths run every statement of the script and report one
//! result per statement; a failing statement never aborts the script.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use rollgate_core::catalog::Instance;
use rollgate_core::error::CoreError;
use rollgate_core::executor::{self, Connection, QueryResult};
use rollgate_core::export::{export, ExportFormat};
use rollgate_core::store::DatabaseFilter;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub statement: String,
    /// Maximum rows kept per result.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub result: QueryResult,
    pub format: ExportFormat,
    /// Target table for SQL exports.
    #[serde(default)]
    pub table: Option<String>,
}

/// Resolve the instance, check the database is registered on it, and open
/// a session.
async fn connect(
    state: &AppState,
    instance_id: &str,
    database: &str,
) -> AppResult<(Instance, Box<dyn Connection>)> {
    let instance = state
        .store
        .get_instance(instance_id)
        .await?
        .ok_or_else(|| CoreError::not_found("Instance", instance_id))?;

    let filter = DatabaseFilter {
        instance_id: Some(instance_id.to_string()),
        ..Default::default()
    };
    let registered = state
        .store
        .list_databases(&filter)
        .await?
        .into_iter()
        .any(|db| db.name == database);
    if !registered {
        return Err(CoreError::not_found("Database", format!("instances/{instance_id}/databases/{database}")).into());
    }

    let conn = state.connections.connect(&instance, Some(database)).await?;
    Ok((instance, conn))
}

fn ensure_statement(statement: &str) -> AppResult<()> {
    if statement.trim().is_empty() {
        return Err(AppError::BadRequest("statement must not be empty".into()));
    }
    Ok(())
}

/// POST /api/v1/instances/{instance}/databases/{database}/query
pub async fn run_query(
    State(state): State<AppState>,
    Path((instance_id, database)): Path<(String, String)>,
    Json(input): Json<QueryRequest>,
) -> AppResult<impl IntoResponse> {
    ensure_statement(&input.statement)?;
    let (instance, mut conn) = connect(&state, &instance_id, &database).await?;

    let results = executor::query(conn.as_mut(), &input.statement, input.limit, state.masker.as_ref()).await;

    tracing::info!(
        instance_id = %instance.id,
        database = %database,
        statements = results.len(),
        failed = results.iter().filter(|r| r.is_error()).count(),
        "Query executed"
    );

    Ok(Json(DataResponse { data: results }))
}

/// POST /api/v1/instances/{instance}/databases/{database}/admin-execute
///
/// Same as a query, without result masking.
pub async fn admin_execute(
    State(state): State<AppState>,
    Path((instance_id, database)): Path<(String, String)>,
    Json(input): Json<QueryRequest>,
) -> AppResult<impl IntoResponse> {
    ensure_statement(&input.statement)?;
    let (instance, mut conn) = connect(&state, &instance_id, &database).await?;

    let results = executor::admin_execute(conn.as_mut(), &input.statement, input.limit).await;

    tracing::info!(
        instance_id = %instance.id,
        database = %database,
        statements = results.len(),
        failed = results.iter().filter(|r| r.is_error()).count(),
        "Admin execute finished"
    );

    Ok(Json(DataResponse { data: results }))
}

/// POST /api/v1/export
///
/// Responds with the rendered file, not a JSON envelope.
pub async fn export_result(Json(input): Json<ExportRequest>) -> AppResult<impl IntoResponse> {
    let body = export(&input.result, input.format, input.table.as_deref())?;
    let disposition = format!("attachment; filename=\"export.{}\"", input.format.extension());

    Ok((
        [
            (header::CONTENT_TYPE, input.format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}
