//! Rows of `platform_events`.

use rollgate_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EventRow {
    pub id: DbId,
    pub event_type: String,
    pub source_entity_type: Option<String>,
    pub source_entity_id: Option<DbId>,
    pub actor: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}

/// Insert DTO for a platform event.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub event_type: &'a str,
    pub source_entity_type: Option<&'a str>,
    pub source_entity_id: Option<DbId>,
    pub actor: Option<&'a str>,
    pub payload: &'a serde_json::Value,
}
