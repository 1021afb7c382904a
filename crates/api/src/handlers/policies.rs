//! Handlers for risk rules and the approval setting.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use rollgate_core::approval::{validate_setting, ApprovalSetting};
use rollgate_core::risk::{validate_risk_expression, CreateRiskRule};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/v1/risk-rules
///
/// The expression is parsed and checked against the risk attributes before
/// the rule is stored.
pub async fn create_risk_rule(
    State(state): State<AppState>,
    Json(input): Json<CreateRiskRule>,
) -> AppResult<impl IntoResponse> {
    if input.title.trim().is_empty() {
        return Err(AppError::BadRequest("title must not be empty".into()));
    }
    validate_risk_expression(&input.expression)?;

    let rule = state.store.create_risk_rule(&input).await?;

    tracing::info!(
        rule_id = rule.id,
        source = rule.source.as_str(),
        level = ?rule.level,
        "Risk rule created"
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: rule })))
}

/// GET /api/v1/risk-rules
pub async fn list_risk_rules(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let rules = state.store.list_risk_rules().await?;
    Ok(Json(DataResponse { data: rules }))
}

/// GET /api/v1/approval-setting
pub async fn get_approval_setting(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let setting = state.store.get_approval_setting().await?;
    Ok(Json(DataResponse { data: setting }))
}

/// PUT /api/v1/approval-setting
///
/// Replaces every rule at once. Rule order is significant: the first rule
/// whose source and condition match picks the template.
pub async fn put_approval_setting(
    State(state): State<AppState>,
    Json(input): Json<ApprovalSetting>,
) -> AppResult<impl IntoResponse> {
    validate_setting(&input)?;

    let saved = state.store.set_approval_setting(&input).await?;

    tracing::info!(rules = saved.rules.len(), "Approval setting replaced");

    Ok(Json(DataResponse { data: saved }))
}
