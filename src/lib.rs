//! opsched -- persistent background job scheduler for the ops dashboard.
//!
//! The crate provides the job store, the tick loop and executor that run
//! due jobs, the actions they invoke, and an HTTP management API.

pub mod actions;
pub mod api;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;

use anyhow::{Context, Result};

use crate::actions::ActionRegistry;
use crate::config::SchedulerConfig;
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::storage::JobStore;

/// Start the daemon: scheduler loop plus API server. Returns after a
/// shutdown signal once in-flight jobs have drained.
pub async fn serve(config: SchedulerConfig) -> Result<()> {
    // 1. Initialize Storage
    let db_path = config.storage.database_path()?;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let store = JobStore::new(storage::open_pool(&db_path)?);

    // 2. Initialize Scheduler
    let registry = ActionRegistry::from_config(&config)?;
    let scheduler = Scheduler::new(store, registry, SchedulerOptions::from(&config.scheduler));

    // 3. Bind the API listener; a bad or busy address fails before any job runs
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // 4. Start Scheduler Engine (background task)
    scheduler.start().await?;

    // 5. Serve the API
    let app = api::router(api::state::AppState {
        scheduler: scheduler.clone(),
    });
    tracing::info!(%addr, "opsched listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
