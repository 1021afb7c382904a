use std::sync::Arc;

use rollgate_core::executor::ResultMasker;
use rollgate_core::scheduling::StageSequencing;
use rollgate_core::store::Store;
use rollgate_events::EventBus;
use rollgate_pipeline::{ConnectionProvider, Planner, Scheduler};
use tokio::sync::Notify;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    /// Control-plane pool; `None` with the in-memory store.
    pub pool: Option<rollgate_db::DbPool>,
    pub config: Arc<ServerConfig>,
    pub event_bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub planner: Arc<Planner>,
    /// Sessions on target databases for the query endpoints.
    pub connections: Arc<dyn ConnectionProvider>,
    /// Applied to interactive query results only.
    pub masker: Arc<dyn ResultMasker>,
    /// Nudges the approval runner after an issue is created.
    pub approval_waker: Arc<Notify>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        pool: Option<rollgate_db::DbPool>,
        config: ServerConfig,
        event_bus: Arc<EventBus>,
        sequencing: StageSequencing,
        connections: Arc<dyn ConnectionProvider>,
        masker: Arc<dyn ResultMasker>,
        approval_waker: Arc<Notify>,
    ) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new(store.clone(), event_bus.clone(), sequencing)),
            planner: Arc::new(Planner::new(store.clone())),
            store,
            pool,
            config: Arc::new(config),
            event_bus,
            connections,
            masker,
            approval_waker,
        }
    }
}
