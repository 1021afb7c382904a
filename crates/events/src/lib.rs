//! Rollout lifecycle events.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`PlatformEvent`]: the event envelope, plus the event type names the
//!   engine publishes.
//! - [`EventPersistence`]: background service writing every event to the
//!   `platform_events` table.

pub mod bus;
pub mod persistence;

pub use bus::{EventBus, PlatformEvent};
pub use persistence::EventPersistence;
