use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rollgate_api::config::{ServerConfig, StoreBackend};
use rollgate_api::router::build_app_router;
use rollgate_api::state::AppState;
use rollgate_core::advisor::KeywordAdvisor;
use rollgate_core::executor::NoopMasker;
use rollgate_core::store::{MemoryStore, Store};
use rollgate_db::PgStore;
use rollgate_events::{EventBus, EventPersistence};
use rollgate_pipeline::{ApprovalConfig, ConnectionProvider, PgConnectionProvider, SchedulerConfig};
use rollgate_worker::Worker;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "rollgate_api=debug,rollgate_pipeline=debug,rollgate_worker=debug,tower_http=debug".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let scheduler_config = SchedulerConfig::from_env();
    let approval_config = ApprovalConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = %config.port,
        store = ?config.store_backend,
        embedded_worker = config.embedded_worker,
        "Loaded server configuration"
    );

    // --- Store ---
    let (store, pool): (Arc<dyn Store>, _) = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
            let pool = rollgate_db::create_pool(&database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            rollgate_db::health_check(&pool)
                .await
                .expect("Database health check failed");
            rollgate_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            (Arc::new(PgStore::new(pool.clone())), Some(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            (Arc::new(MemoryStore::new()), None)
        }
    };

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());
    let persistence_handle = pool
        .clone()
        .map(|pool| tokio::spawn(EventPersistence::run(pool, event_bus.subscribe())));
    tracing::info!(persisted = persistence_handle.is_some(), "Event bus created");

    // --- Engine ---
    let connections: Arc<dyn ConnectionProvider> = Arc::new(PgConnectionProvider);
    let sequencing = scheduler_config.stage_sequencing;
    let cancel = CancellationToken::new();

    let (approval_waker, worker_handle) = if config.embedded_worker {
        let worker = Arc::new(Worker::new(
            Arc::clone(&store),
            Arc::clone(&connections),
            Arc::new(KeywordAdvisor),
            Arc::clone(&event_bus),
            scheduler_config,
            approval_config,
        ));
        let waker = worker.approval_waker();
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(worker_cancel).await });
        tracing::info!("Embedded worker started");
        (waker, Some(handle))
    } else {
        (Arc::new(Notify::new()), None)
    };

    // --- Router ---
    let state = AppState::new(
        store,
        pool,
        config.clone(),
        Arc::clone(&event_bus),
        sequencing,
        connections,
        Arc::new(NoopMasker),
        approval_waker,
    );
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST:PORT combination");
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    cancel.cancel();
    if let Some(handle) = worker_handle {
        let drain = Duration::from_secs(config.shutdown_timeout_secs);
        if tokio::time::timeout(drain, handle).await.is_err() {
            tracing::warn!("Embedded worker did not stop in time");
        }
    }

    // Dropping the last bus handle closes the channel and stops persistence.
    drop(event_bus);
    if let Some(handle) = persistence_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly under container orchestrators.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
