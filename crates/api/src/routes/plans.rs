use axum::routing::{get, post};
use axum::Router;

use crate::handlers::plans;
use crate::state::AppState;

/// Routes mounted at `/projects/{project}/plans`.
///
/// ```text
/// POST   /          -> create_plan
/// GET    /{plan}    -> get_plan
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(plans::create_plan))
        .route("/{plan}", get(plans::get_plan))
}
