use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use rollgate_core::error::CoreError;
use rollgate_core::types::DbId;
use rollgate_db::repositories::EventRepo;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub entity_type: String,
    pub entity_id: DbId,
}

/// GET /api/v1/events?entity_type=task_run&entity_id=42
///
/// Events are only persisted with the PostgreSQL store.
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventQuery>,
) -> AppResult<impl IntoResponse> {
    let pool = state.pool.as_ref().ok_or_else(|| {
        CoreError::FailedPrecondition("event history requires the postgres store".into())
    })?;

    let events = EventRepo::list_for_source(pool, &params.entity_type, params.entity_id).await?;
    Ok(Json(DataResponse { data: events }))
}
