//! Handlers for rollouts and the stage batch operations.
//!
//! Batch requests name tasks (or task runs) by full resource name. Every
//! name must sit under the stage in the request path; a mismatch is a
//! bad request rather than a silent no-op.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use rollgate_core::error::CoreError;
use rollgate_core::resource_name::{PlanName, StageName, TaskName, TaskRunName};
use rollgate_core::rollout::{Rollout, Stage, Task};
use rollgate_core::types::DbId;

use crate::error::AppResult;
use crate::handlers::ensure_same_project;
use crate::handlers::plans::load_plan;
use crate::response::DataResponse;
use crate::state::AppState;

const DEFAULT_CREATOR: &str = "anonymous";

#[derive(Debug, Deserialize)]
pub struct CreateRolloutRequest {
    /// `projects/{project}/plans/{id}`.
    pub plan: String,
}

/// Body of the run / re-run / skip batch operations.
#[derive(Debug, Deserialize)]
pub struct TaskBatchRequest {
    /// Task resource names.
    pub tasks: Vec<String>,
    #[serde(default)]
    pub creator: Option<String>,
    /// Only used by skip.
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// Task run resource names.
    pub task_runs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

async fn load_rollout(state: &AppState, project_id: &str, rollout_id: DbId) -> AppResult<Rollout> {
    let rollout = state
        .store
        .get_rollout(rollout_id)
        .await?
        .filter(|r| r.project_id == project_id)
        .ok_or_else(|| CoreError::not_found("Rollout", rollout_id))?;
    Ok(rollout)
}

async fn load_stage(
    state: &AppState,
    project_id: &str,
    rollout_id: DbId,
    stage_id: DbId,
) -> AppResult<(Rollout, Stage)> {
    let rollout = load_rollout(state, project_id, rollout_id).await?;
    let stage = rollout
        .stages
        .iter()
        .find(|s| s.id == stage_id)
        .cloned()
        .ok_or_else(|| CoreError::not_found("Stage", stage_id))?;
    Ok((rollout, stage))
}

async fn load_task(
    state: &AppState,
    project_id: &str,
    rollout_id: DbId,
    stage_id: DbId,
    task_id: DbId,
) -> AppResult<Task> {
    load_stage(state, project_id, rollout_id, stage_id).await?;
    let task = state
        .store
        .get_task(task_id)
        .await?
        .filter(|t| t.stage_id == stage_id)
        .ok_or_else(|| CoreError::not_found("Task", task_id))?;
    Ok(task)
}

/// Parse task names and check each one lives under `stage`.
fn task_ids(stage: &StageName, names: &[String]) -> AppResult<Vec<DbId>> {
    names
        .iter()
        .map(|raw| {
            let name = TaskName::parse(raw)?;
            if name.stage() != *stage {
                return Err(CoreError::Validation(format!("task '{raw}' is not in stage '{stage}'")).into());
            }
            Ok(name.task_id)
        })
        .collect()
}

fn task_run_ids(stage: &StageName, names: &[String]) -> AppResult<Vec<DbId>> {
    names
        .iter()
        .map(|raw| {
            let name = TaskRunName::parse(raw)?;
            if name.task.stage() != *stage {
                return Err(CoreError::Validation(format!("task run '{raw}' is not in stage '{stage}'")).into());
            }
            Ok(name.task_run_id)
        })
        .collect()
}

/// With approval enforcement on, a rollout whose plan has an issue may only
/// start once that issue is approved (or needs no approval).
async fn ensure_approved(state: &AppState, rollout: &Rollout) -> AppResult<()> {
    if !state.config.enforce_approval {
        return Ok(());
    }
    let Some(issue) = state.store.get_issue_by_plan(rollout.plan_id).await? else {
        return Ok(());
    };
    if !issue.approval.is_approved() {
        return Err(CoreError::FailedPrecondition(format!(
            "issue {} is not approved (approval status {:?})",
            issue.id,
            issue.approval_status()
        ))
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rollouts
// ---------------------------------------------------------------------------

/// POST /api/v1/projects/{project}/rollouts
///
/// Compiles the plan into stages against the current inventory. A plan has
/// at most one rollout.
pub async fn create_rollout(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(input): Json<CreateRolloutRequest>,
) -> AppResult<impl IntoResponse> {
    let plan_name = PlanName::parse(&input.plan)?;
    ensure_same_project(&project_id, &plan_name.project_id)?;
    load_plan(&state, &project_id, plan_name.plan_id).await?;

    let rollout = state.planner.create_rollout(plan_name.plan_id).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: rollout })))
}

/// GET /api/v1/projects/{project}/rollouts/{rollout}
pub async fn get_rollout(
    State(state): State<AppState>,
    Path((project_id, rollout_id)): Path<(String, DbId)>,
) -> AppResult<impl IntoResponse> {
    let rollout = load_rollout(&state, &project_id, rollout_id).await?;
    Ok(Json(DataResponse { data: rollout }))
}

// ---------------------------------------------------------------------------
// Stage batch operations
// ---------------------------------------------------------------------------

/// POST /api/v1/projects/{project}/rollouts/{rollout}/stages/{stage}/run
///
/// Idempotent: tasks that already have an outstanding run are reported as
/// such and no second run is created.
pub async fn batch_run(
    State(state): State<AppState>,
    Path((project_id, rollout_id, stage_id)): Path<(String, DbId, DbId)>,
    Json(input): Json<TaskBatchRequest>,
) -> AppResult<impl IntoResponse> {
    let (rollout, _) = load_stage(&state, &project_id, rollout_id, stage_id).await?;
    let stage_name = StageName {
        project_id,
        rollout_id,
        stage_id,
    };
    let ids = task_ids(&stage_name, &input.tasks)?;
    ensure_approved(&state, &rollout).await?;

    let creator = input.creator.as_deref().unwrap_or(DEFAULT_CREATOR);
    let triggers = state.scheduler.trigger_run(stage_id, &ids, creator).await?;
    Ok(Json(DataResponse { data: triggers }))
}

/// POST /api/v1/projects/{project}/rollouts/{rollout}/stages/{stage}/rerun
pub async fn batch_rerun(
    State(state): State<AppState>,
    Path((project_id, rollout_id, stage_id)): Path<(String, DbId, DbId)>,
    Json(input): Json<TaskBatchRequest>,
) -> AppResult<impl IntoResponse> {
    let (rollout, _) = load_stage(&state, &project_id, rollout_id, stage_id).await?;
    let stage_name = StageName {
        project_id,
        rollout_id,
        stage_id,
    };
    let ids = task_ids(&stage_name, &input.tasks)?;
    ensure_approved(&state, &rollout).await?;

    let creator = input.creator.as_deref().unwrap_or(DEFAULT_CREATOR);
    let triggers = state.scheduler.rerun(stage_id, &ids, creator).await?;
    Ok(Json(DataResponse { data: triggers }))
}

/// POST /api/v1/projects/{project}/rollouts/{rollout}/stages/{stage}/skip
pub async fn batch_skip(
    State(state): State<AppState>,
    Path((project_id, rollout_id, stage_id)): Path<(String, DbId, DbId)>,
    Json(input): Json<TaskBatchRequest>,
) -> AppResult<impl IntoResponse> {
    load_stage(&state, &project_id, rollout_id, stage_id).await?;
    let stage_name = StageName {
        project_id,
        rollout_id,
        stage_id,
    };
    let ids = task_ids(&stage_name, &input.tasks)?;

    let reason = input.reason.as_deref().unwrap_or_default();
    let skips = state.scheduler.skip(stage_id, &ids, reason).await?;
    Ok(Json(DataResponse { data: skips }))
}

/// POST /api/v1/projects/{project}/rollouts/{rollout}/stages/{stage}/cancel
///
/// Pending runs are canceled immediately; running ones stop before their
/// next statement.
pub async fn batch_cancel(
    State(state): State<AppState>,
    Path((project_id, rollout_id, stage_id)): Path<(String, DbId, DbId)>,
    Json(input): Json<CancelRequest>,
) -> AppResult<impl IntoResponse> {
    load_stage(&state, &project_id, rollout_id, stage_id).await?;
    let stage_name = StageName {
        project_id,
        rollout_id,
        stage_id,
    };
    let ids = task_run_ids(&stage_name, &input.task_runs)?;

    let cancels = state.scheduler.cancel(stage_id, &ids).await?;
    Ok(Json(DataResponse { data: cancels }))
}

// ---------------------------------------------------------------------------
// Task runs
// ---------------------------------------------------------------------------

/// GET /api/v1/projects/{project}/rollouts/{rollout}/stages/{stage}/tasks/{task}/task-runs
pub async fn list_task_runs(
    State(state): State<AppState>,
    Path((project_id, rollout_id, stage_id, task_id)): Path<(String, DbId, DbId, DbId)>,
) -> AppResult<impl IntoResponse> {
    load_task(&state, &project_id, rollout_id, stage_id, task_id).await?;
    let runs = state.scheduler.list_task_runs(task_id).await?;
    Ok(Json(DataResponse { data: runs }))
}

/// GET /api/v1/projects/{project}/rollouts/{rollout}/stages/{stage}/tasks/{task}/task-runs/{run}
pub async fn get_task_run(
    State(state): State<AppState>,
    Path((project_id, rollout_id, stage_id, task_id, run_id)): Path<(String, DbId, DbId, DbId, DbId)>,
) -> AppResult<impl IntoResponse> {
    load_task(&state, &project_id, rollout_id, stage_id, task_id).await?;
    let run = state
        .store
        .get_task_run(run_id)
        .await?
        .filter(|r| r.task_id == task_id)
        .ok_or_else(|| CoreError::not_found("TaskRun", run_id))?;
    Ok(Json(DataResponse { data: run }))
}
