//! Kiln Controller
//!
//! Trigger-driven build orchestration control plane.
//!
//! Architecture:
//! - Repository: versioned object store (in-memory or PostgreSQL) with
//!   compare-and-swap writes and a change-log watch
//! - Services: trigger evaluation, build creation and strategy dispatch
//! - Controller: keyed workers driving every Build through its lifecycle
//! - API: webhooks, image-change notifications, executor callbacks and
//!   read access over HTTP
//!
//! Any number of controller instances may share one PostgreSQL store; only
//! the instance whose compare-and-swap moves a build to Pending starts it.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod executor;
pub mod repository;
pub mod retry;
pub mod service;

#[cfg(test)]
mod testing;

use crate::config::{Config, StoreBackend};
use crate::controller::BuildController;
use crate::executor::HttpExecutor;
use crate::repository::{MemoryStore, ObjectStore, PostgresStore, Store, StoreError};
use crate::retry::with_backoff;
use crate::service::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Controller...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: store={}, executor_url={}, workers={}",
        match config.store {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres { .. } => "postgres",
        },
        config.executor_url,
        config.workers
    );

    let cancel = CancellationToken::new();
    let controller_config = config.controller();

    let store = Store::new(open_backend(&config.store, config.change_retention).await?)
        .with_poll_interval(config.watch_poll_interval);

    // The store may come up after us in container environments
    let store_ref = &store;
    with_backoff(
        controller_config.transient_backoff,
        &cancel,
        "Store connection",
        StoreError::is_transient,
        move || store_ref.ping(),
    )
    .await
    .context("Object store is unavailable")?;
    info!("Object store ready");

    let executor = HttpExecutor::new(config.executor_url.clone())
        .context("Failed to create executor client")?;
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(executor),
        config.default_registry.clone(),
    ));

    let (controller, handle) = BuildController::new(
        store.clone(),
        dispatcher,
        controller_config.clone(),
        cancel.clone(),
    );
    let controller_task = tokio::spawn(controller.run());

    // Build router with all API endpoints
    let app = api::create_router(api::AppState {
        store,
        controller: handle,
        conflict_retries: controller_config.conflict_retries,
        transient_backoff: controller_config.transient_backoff,
    });

    info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    // The server can also stop on its own; make sure the controller follows
    cancel.cancel();
    controller_task
        .await
        .context("Controller task panicked")?
        .context("Controller failed")?;

    info!("Kiln Controller stopped");
    Ok(())
}

async fn open_backend(backend: &StoreBackend, retention: usize) -> Result<Arc<dyn ObjectStore>> {
    match backend {
        StoreBackend::Memory => {
            info!("Using in-memory object store");
            Ok(Arc::new(MemoryStore::with_retention(retention)))
        }
        StoreBackend::Postgres { database_url } => {
            info!("Connecting to database...");
            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;

            info!("Database connection pool created");

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;

            Ok(Arc::new(PostgresStore::new(pool).with_retention(retention)))
        }
    }
}
