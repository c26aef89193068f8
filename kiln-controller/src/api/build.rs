//! Build API Handlers
//!
//! HTTP endpoints for reading builds, cancelling them and receiving executor
//! callbacks. Cancellations and callbacks are queued to the controller, which
//! applies them in order with everything else touching the same build.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use kiln_core::domain::build::Build;
use kiln_core::domain::meta::ObjectKey;
use kiln_core::dto::build::BuildSummary;
use kiln_core::dto::execution::ExecutorCallback;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::build_service::{self, BuildError};

fn map_build_error(e: BuildError) -> ApiError {
    match e {
        BuildError::NotFound(key) => ApiError::NotFound(format!("Build {} not found", key)),
        BuildError::StoreError(err) => ApiError::from(err),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListBuildsQuery {
    /// Only builds created from this BuildConfig
    pub config: Option<String>,
}

/// GET /namespaces/{ns}/builds
/// List builds, newest first
pub async fn list_builds(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Query(query): Query<ListBuildsQuery>,
) -> ApiResult<Json<Vec<BuildSummary>>> {
    tracing::debug!("Listing builds in {} (config: {:?})", ns, query.config);

    let builds = build_service::list_builds(&state.store, &ns, query.config.as_deref())
        .await
        .map_err(map_build_error)?;

    Ok(Json(builds.into_iter().map(BuildSummary::from).collect()))
}

/// GET /namespaces/{ns}/builds/{name}
/// Get a build by name
pub async fn get_build(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<Build>> {
    let key = ObjectKey::new(ns, name);
    tracing::debug!("Getting build: {}", key);

    let build = build_service::get_build(&state.store, &key)
        .await
        .map_err(map_build_error)?;

    Ok(Json(build))
}

/// POST /namespaces/{ns}/builds/{name}/cancel
/// Request cancellation of a build that has not finished
pub async fn cancel_build(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let key = ObjectKey::new(ns, name);

    let build = build_service::get_build(&state.store, &key)
        .await
        .map_err(map_build_error)?;
    if build.status.phase.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Build {} already finished ({})",
            key, build.status.phase
        )));
    }

    tracing::info!("Cancelling build {}", key);
    state.controller.cancel_build(key.clone()).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "build": key.name }))))
}

/// POST /namespaces/{ns}/builds/{name}/callback
/// Executor progress report
pub async fn executor_callback(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Json(callback): Json<ExecutorCallback>,
) -> ApiResult<StatusCode> {
    let key = ObjectKey::new(ns, name);
    tracing::debug!("Executor callback for {}: {:?}", key, callback.event);

    build_service::get_build(&state.store, &key)
        .await
        .map_err(map_build_error)?;

    state.controller.executor_callback(key, callback).await?;

    Ok(StatusCode::ACCEPTED)
}
