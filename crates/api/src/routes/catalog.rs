//! Route definitions for the inventory: instances, databases, deployment
//! configs and database groups.

use axum::routing::get;
use axum::Router;

use crate::handlers::catalog;
use crate::state::AppState;

/// Routes mounted at `/instances`.
///
/// ```text
/// GET    /                         -> list_instances
/// POST   /                         -> create_instance
/// GET    /{instance}               -> get_instance
/// GET    /{instance}/databases     -> list_instance_databases
/// POST   /{instance}/databases     -> create_database
/// ```
pub fn instance_router() -> Router<AppState> {
    Router::new()
        .route("/", get(catalog::list_instances).post(catalog::create_instance))
        .route("/{instance}", get(catalog::get_instance))
        .route(
            "/{instance}/databases",
            get(catalog::list_instance_databases).post(catalog::create_database),
        )
}

/// Routes merged under `/projects/{project}`.
///
/// ```text
/// GET    /databases                 -> list_project_databases
/// GET    /deployment-config         -> get_deployment_config
/// PUT    /deployment-config         -> put_deployment_config
/// GET    /database-groups           -> list_database_groups
/// POST   /database-groups           -> create_database_group
/// GET    /database-groups/{group}   -> get_database_group
/// ```
pub fn project_router() -> Router<AppState> {
    Router::new()
        .route("/databases", get(catalog::list_project_databases))
        .route(
            "/deployment-config",
            get(catalog::get_deployment_config).put(catalog::put_deployment_config),
        )
        .route(
            "/database-groups",
            get(catalog::list_database_groups).post(catalog::create_database_group),
        )
        .route("/database-groups/{group}", get(catalog::get_database_group))
}
