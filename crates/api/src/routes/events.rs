use axum::routing::get;
use axum::Router;

use crate::handlers::events;
use crate::state::AppState;

/// `GET /events?entity_type=..&entity_id=.. -> list_events`
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(events::list_events))
}
