pub mod catalog;
pub mod events;
pub mod health;
pub mod issues;
pub mod plans;
pub mod policies;
pub mod query;
pub mod rollouts;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /instances                                              list, register
/// /instances/{instance}                                   get
/// /instances/{instance}/databases                         list, register
/// /instances/{instance}/databases/{database}/query        interactive query (POST)
/// /instances/{instance}/databases/{database}/admin-execute  unmasked execute (POST)
/// /export                                                 re-serialize a result (POST)
///
/// /risk-rules                                             list, create
/// /approval-setting                                       get, replace (PUT)
///
/// /projects/{project}/databases                           list
/// /projects/{project}/deployment-config                   get, replace (PUT)
/// /projects/{project}/database-groups                     list, create
/// /projects/{project}/database-groups/{group}             get with live partition
///
/// /projects/{project}/plans                               create
/// /projects/{project}/plans/{plan}                        get
///
/// /projects/{project}/rollouts                            create from plan (POST)
/// /projects/{project}/rollouts/{rollout}                  get
/// /projects/{project}/rollouts/{rollout}/stages/{stage}/run      batch run (POST)
/// /projects/{project}/rollouts/{rollout}/stages/{stage}/rerun    batch re-run (POST)
/// /projects/{project}/rollouts/{rollout}/stages/{stage}/skip     skip tasks (POST)
/// /projects/{project}/rollouts/{rollout}/stages/{stage}/cancel   cancel task runs (POST)
/// /projects/{project}/rollouts/{rollout}/stages/{stage}/tasks/{task}/task-runs        list
/// /projects/{project}/rollouts/{rollout}/stages/{stage}/tasks/{task}/task-runs/{run}  get
///
/// /projects/{project}/issues                              create
/// /projects/{project}/issues/{issue}                      get
/// /projects/{project}/issues/{issue}/approval-finding     wait for finding (GET)
/// /projects/{project}/issues/{issue}/approve              approve step (POST)
/// /projects/{project}/issues/{issue}/reject               reject step (POST)
///
/// /events                                                 event history (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/instances", catalog::instance_router())
        .merge(query::router())
        .merge(policies::router())
        .nest("/projects/{project}", project_routes())
        .nest("/events", events::router())
}

fn project_routes() -> Router<AppState> {
    Router::new()
        .merge(catalog::project_router())
        .nest("/plans", plans::router())
        .nest("/rollouts", rollouts::router())
        .nest("/issues", issues::router())
}
