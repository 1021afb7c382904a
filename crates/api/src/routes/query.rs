use axum::routing::post;
use axum::Router;

use crate::handlers::query;
use crate::state::AppState;

/// Query and export routes.
///
/// ```text
/// POST   /instances/{instance}/databases/{database}/query           -> run_query
/// POST   /instances/{instance}/databases/{database}/admin-execute   -> admin_execute
/// POST   /export                                                    -> export_result
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/instances/{instance}/databases/{database}/query",
            post(query::run_query),
        )
        .route(
            "/instances/{instance}/databases/{database}/admin-execute",
            post(query::admin_execute),
        )
        .route("/export", post(query::export_result))
}
