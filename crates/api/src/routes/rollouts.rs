//! Route definitions for rollouts, stages, tasks and task runs.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::rollouts;
use crate::state::AppState;

/// Routes mounted at `/projects/{project}/rollouts`.
///
/// ```text
/// POST   /                                                  -> create_rollout
/// GET    /{rollout}                                         -> get_rollout
/// POST   /{rollout}/stages/{stage}/run                      -> batch_run
/// POST   /{rollout}/stages/{stage}/rerun                    -> batch_rerun
/// POST   /{rollout}/stages/{stage}/skip                     -> batch_skip
/// POST   /{rollout}/stages/{stage}/cancel                   -> batch_cancel
/// GET    /{rollout}/stages/{stage}/tasks/{task}/task-runs         -> list_task_runs
/// GET    /{rollout}/stages/{stage}/tasks/{task}/task-runs/{run}   -> get_task_run
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(rollouts::create_rollout))
        .route("/{rollout}", get(rollouts::get_rollout))
        .route("/{rollout}/stages/{stage}/run", post(rollouts::batch_run))
        .route("/{rollout}/stages/{stage}/rerun", post(rollouts::batch_rerun))
        .route("/{rollout}/stages/{stage}/skip", post(rollouts::batch_skip))
        .route("/{rollout}/stages/{stage}/cancel", post(rollouts::batch_cancel))
        .route(
            "/{rollout}/stages/{stage}/tasks/{task}/task-runs",
            get(rollouts::list_task_runs),
        )
        .route(
            "/{rollout}/stages/{stage}/tasks/{task}/task-runs/{run}",
            get(rollouts::get_task_run),
        )
}
