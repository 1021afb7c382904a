use std::sync::Arc;
use std::time::Duration;

use rollgate_core::advisor::KeywordAdvisor;
use rollgate_db::PgStore;
use rollgate_events::{EventBus, EventPersistence};
use rollgate_pipeline::{ApprovalConfig, PgConnectionProvider, SchedulerConfig};
use rollgate_worker::Worker;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rollgate_worker=debug,rollgate_pipeline=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let scheduler_config = SchedulerConfig::from_env();
    let approval_config = ApprovalConfig::from_env();
    tracing::info!(
        max_concurrent = scheduler_config.max_concurrent_task_runs,
        sequencing = ?scheduler_config.stage_sequencing,
        "Loaded worker configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = rollgate_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    rollgate_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    rollgate_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database ready");

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());
    let persistence_handle = tokio::spawn(EventPersistence::run(pool.clone(), event_bus.subscribe()));

    // --- Engine ---
    let worker = Worker::new(
        Arc::new(PgStore::new(pool)),
        Arc::new(PgConnectionProvider),
        Arc::new(KeywordAdvisor),
        Arc::clone(&event_bus),
        scheduler_config,
        approval_config,
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    worker.run(cancel).await;

    // Dropping the last bus handle closes the channel and stops persistence.
    drop(worker);
    drop(event_bus);
    let _ = tokio::time::timeout(Duration::from_secs(5), persistence_handle).await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM.
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
