//! Handlers for `/projects/{project}/plans`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use rollgate_core::error::CoreError;
use rollgate_core::rollout::{CreatePlan, Plan};
use rollgate_core::types::DbId;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Load a plan and check it belongs to `project_id`.
///
/// Plans of other projects are reported as missing.
pub(crate) async fn load_plan(state: &AppState, project_id: &str, plan_id: DbId) -> AppResult<Plan> {
    let plan = state
        .store
        .get_plan(plan_id)
        .await?
        .filter(|p| p.project_id == project_id)
        .ok_or_else(|| CoreError::not_found("Plan", plan_id))?;
    Ok(plan)
}

/// POST /api/v1/projects/{project}/plans
///
/// Specs are validated up front; target resolution happens when the
/// rollout is created.
pub async fn create_plan(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(input): Json<CreatePlan>,
) -> AppResult<impl IntoResponse> {
    input.validate(&project_id)?;

    let plan = state.store.create_plan(&project_id, &input).await?;

    tracing::info!(
        plan_id = plan.id,
        project_id = %plan.project_id,
        specs = plan.specs.len(),
        "Plan created"
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: plan })))
}

/// GET /api/v1/projects/{project}/plans/{plan}
pub async fn get_plan(
    State(state): State<AppState>,
    Path((project_id, plan_id)): Path<(String, DbId)>,
) -> AppResult<impl IntoResponse> {
    let plan = load_plan(&state, &project_id, plan_id).await?;
    Ok(Json(DataResponse { data: plan }))
}
