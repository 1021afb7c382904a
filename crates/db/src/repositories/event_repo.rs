//! Repository for the `platform_events` table.

use rollgate_core::types::DbId;
use sqlx::PgPool;

use crate::models::event::{EventRow, NewEvent};

const COLUMNS: &str = "id, event_type, source_entity_type, source_entity_id, actor, payload, created_at";

pub struct EventRepo;

impl EventRepo {
    pub async fn insert(pool: &PgPool, event: &NewEvent<'_>) -> Result<DbId, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO platform_events (event_type, source_entity_type, source_entity_id, actor, payload)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(event.event_type)
        .bind(event.source_entity_type)
        .bind(event.source_entity_id)
        .bind(event.actor)
        .bind(event.payload)
        .fetch_one(pool)
        .await
    }

    /// Events about one entity, oldest first.
    pub async fn list_for_source(
        pool: &PgPool,
        entity_type: &str,
        entity_id: DbId,
    ) -> Result<Vec<EventRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM platform_events
             WHERE source_entity_type = $1 AND source_entity_id = $2
             ORDER BY id"
        );
        sqlx::query_as::<_, EventRow>(&query)
            .bind(entity_type)
            .bind(entity_id)
            .fetch_all(pool)
            .await
    }
}
