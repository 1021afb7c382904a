//! Handlers for issues and their approval flow.
//!
//! Creating an issue only records it; the approval finding is produced in
//! the background by the approval runner. Clients either poll the issue or
//! use the bounded wait endpoint.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use rollgate_core::error::CoreError;
use rollgate_core::issue::{ApprovalAction, CreateIssue, Issue};
use rollgate_core::resource_name::PlanName;
use rollgate_core::types::DbId;
use rollgate_pipeline::wait_for_approval_finding;

use crate::error::{AppError, AppResult};
use crate::handlers::ensure_same_project;
use crate::handlers::plans::load_plan;
use crate::response::DataResponse;
use crate::state::AppState;

const DEFAULT_MAX_POLLS: u32 = 10;
const MAX_POLLS_LIMIT: u32 = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, Deserialize)]
pub struct CreateIssueRequest {
    /// `projects/{project}/plans/{id}`.
    pub plan: String,
    pub title: String,
    #[serde(default)]
    pub creator: Option<String>,
}

/// Query parameters for the approval finding wait.
#[derive(Debug, Deserialize)]
pub struct WaitParams {
    pub max_polls: Option<u32>,
    pub poll_interval_ms: Option<u64>,
}

async fn load_issue(state: &AppState, project_id: &str, issue_id: DbId) -> AppResult<Issue> {
    let issue = state
        .store
        .get_issue(issue_id)
        .await?
        .filter(|i| i.project_id == project_id)
        .ok_or_else(|| CoreError::not_found("Issue", issue_id))?;
    Ok(issue)
}

/// POST /api/v1/projects/{project}/issues
///
/// Returns the issue with approval status `CHECKING`.
pub async fn create_issue(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(input): Json<CreateIssueRequest>,
) -> AppResult<impl IntoResponse> {
    if input.title.trim().is_empty() {
        return Err(AppError::BadRequest("title must not be empty".into()));
    }
    let plan_name = PlanName::parse(&input.plan)?;
    ensure_same_project(&project_id, &plan_name.project_id)?;
    load_plan(&state, &project_id, plan_name.plan_id).await?;

    let create = CreateIssue {
        plan_id: plan_name.plan_id,
        title: input.title,
        creator: input.creator,
    };
    let issue = state.store.create_issue(&project_id, &create).await?;

    // The runner also polls, this just shortens the wait.
    state.approval_waker.notify_one();

    tracing::info!(
        issue_id = issue.id,
        plan_id = issue.plan_id,
        project_id = %issue.project_id,
        "Issue created"
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: issue })))
}

/// GET /api/v1/projects/{project}/issues/{issue}
pub async fn get_issue(
    State(state): State<AppState>,
    Path((project_id, issue_id)): Path<(String, DbId)>,
) -> AppResult<impl IntoResponse> {
    let issue = load_issue(&state, &project_id, issue_id).await?;
    Ok(Json(DataResponse { data: issue }))
}

/// GET /api/v1/projects/{project}/issues/{issue}/approval-finding
///
/// Waits a bounded number of polls for the finding. Responds 504 when it is
/// still not done; the call can simply be repeated.
pub async fn wait_approval_finding(
    State(state): State<AppState>,
    Path((project_id, issue_id)): Path<(String, DbId)>,
    Query(params): Query<WaitParams>,
) -> AppResult<impl IntoResponse> {
    load_issue(&state, &project_id, issue_id).await?;

    let max_polls = params
        .max_polls
        .unwrap_or(DEFAULT_MAX_POLLS)
        .clamp(1, MAX_POLLS_LIMIT);
    let interval = Duration::from_millis(params.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS));

    let issue = wait_for_approval_finding(state.store.as_ref(), issue_id, interval, max_polls).await?;
    Ok(Json(DataResponse { data: issue }))
}

/// POST /api/v1/projects/{project}/issues/{issue}/approve
pub async fn approve_issue(
    State(state): State<AppState>,
    Path((project_id, issue_id)): Path<(String, DbId)>,
    Json(input): Json<ApprovalAction>,
) -> AppResult<impl IntoResponse> {
    let issue = load_issue(&state, &project_id, issue_id).await?;
    let mut finding = issue.approval.clone();
    finding.approve(&input.role, &input.principal)?;

    let updated = state
        .store
        .update_approval(issue_id, &issue.approval, &finding)
        .await?;

    tracing::info!(
        issue_id,
        role = %input.role,
        principal = %input.principal,
        status = ?updated.approval_status(),
        "Issue approval step approved"
    );

    Ok(Json(DataResponse { data: updated }))
}

/// POST /api/v1/projects/{project}/issues/{issue}/reject
pub async fn reject_issue(
    State(state): State<AppState>,
    Path((project_id, issue_id)): Path<(String, DbId)>,
    Json(input): Json<ApprovalAction>,
) -> AppResult<impl IntoResponse> {
    let issue = load_issue(&state, &project_id, issue_id).await?;
    let mut finding = issue.approval.clone();
    finding.reject(&input.role, &input.principal)?;

    let updated = state
        .store
        .update_approval(issue_id, &issue.approval, &finding)
        .await?;

    tracing::info!(
        issue_id,
        role = %input.role,
        principal = %input.principal,
        "Issue approval step rejected"
    );

    Ok(Json(DataResponse { data: updated }))
}
