//! API Module
//!
//! HTTP API layer for the controller.
//! Each submodule handles endpoints for a specific resource.

pub mod build;
pub mod build_config;
pub mod error;
pub mod health;
pub mod image_change;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::controller::ControllerHandle;
use crate::repository::Store;
use crate::retry::Backoff;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub controller: ControllerHandle,
    /// Re-reads allowed after a compare-and-swap conflict
    pub conflict_retries: u32,
    /// Retry schedule for writes failing with transient store errors
    pub transient_backoff: Backoff,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // BuildConfig endpoints
        .route(
            "/namespaces/{ns}/buildconfigs",
            post(build_config::create_build_config).get(build_config::list_build_configs),
        )
        .route(
            "/namespaces/{ns}/buildconfigs/{name}",
            get(build_config::get_build_config),
        )
        .route(
            "/namespaces/{ns}/buildconfigs/{name}/instantiate",
            post(build_config::instantiate),
        )
        .route(
            "/namespaces/{ns}/buildconfigs/{name}/webhooks/{secret}/{kind}",
            post(webhook::receive_webhook),
        )
        // Image change notifications
        .route(
            "/namespaces/{ns}/imagechanges",
            post(image_change::notify_image_change),
        )
        // Build endpoints
        .route("/namespaces/{ns}/builds", get(build::list_builds))
        .route("/namespaces/{ns}/builds/{name}", get(build::get_build))
        .route(
            "/namespaces/{ns}/builds/{name}/cancel",
            post(build::cancel_build),
        )
        .route(
            "/namespaces/{ns}/builds/{name}/callback",
            post(build::executor_callback),
        )
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
