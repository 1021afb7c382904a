use axum::routing::get;
use axum::Router;

use crate::handlers::policies;
use crate::state::AppState;

/// Workspace-wide policy routes.
///
/// ```text
/// GET    /risk-rules         -> list_risk_rules
/// POST   /risk-rules         -> create_risk_rule
/// GET    /approval-setting   -> get_approval_setting
/// PUT    /approval-setting   -> put_approval_setting
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/risk-rules",
            get(policies::list_risk_rules).post(policies::create_risk_rule),
        )
        .route(
            "/approval-setting",
            get(policies::get_approval_setting).put(policies::put_approval_setting),
        )
}
