//! Durable event persistence.
//!
//! [`EventPersistence`] subscribes to the bus and writes every event to
//! `platform_events`. It exits when the bus is dropped.

use rollgate_core::types::DbId;
use rollgate_db::models::event::NewEvent;
use rollgate_db::repositories::EventRepo;
use rollgate_db::DbPool;
use tokio::sync::broadcast;

use crate::bus::PlatformEvent;

pub struct EventPersistence;

impl EventPersistence {
    /// Persist events from `receiver` until the channel closes.
    pub async fn run(pool: DbPool, mut receiver: broadcast::Receiver<PlatformEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(e) = Self::persist(&pool, &event).await {
                        tracing::error!(
                            error = %e,
                            event_type = %event.event_type,
                            "Failed to persist event"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event persistence lagged, some events were not persisted");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, persistence shutting down");
                    break;
                }
            }
        }
    }

    async fn persist(pool: &DbPool, event: &PlatformEvent) -> Result<DbId, sqlx::Error> {
        EventRepo::insert(
            pool,
            &NewEvent {
                event_type: &event.event_type,
                source_entity_type: event.source_entity_type.as_deref(),
                source_entity_id: event.source_entity_id,
                actor: event.actor.as_deref(),
                payload: &event.payload,
            },
        )
        .await
    }
}
