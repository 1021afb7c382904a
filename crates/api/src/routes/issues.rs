use axum::routing::{get, post};
use axum::Router;

use crate::handlers::issues;
use crate::state::AppState;

/// Routes mounted at `/projects/{project}/issues`.
///
/// ```text
/// POST   /                            -> create_issue
/// GET    /{issue}                     -> get_issue
/// GET    /{issue}/approval-finding    -> wait_approval_finding
/// POST   /{issue}/approve             -> approve_issue
/// POST   /{issue}/reject              -> reject_issue
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(issues::create_issue))
        .route("/{issue}", get(issues::get_issue))
        .route("/{issue}/approval-finding", get(issues::wait_approval_finding))
        .route("/{issue}/approve", post(issues::approve_issue))
        .route("/{issue}/reject", post(issues::reject_issue))
}
