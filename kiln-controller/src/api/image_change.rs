//! Image Change API Handler
//!
//! Receives notifications that an image stream tag now points at a new image.

use axum::{
    Json,
    extract::{Path, State},
};
use kiln_core::dto::webhook::ImageChangeNotification;
use serde::Serialize;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::trigger_service::{self, ImageChangeResult, TriggerError};

/// Per-config outcome of a notification
#[derive(Debug, Serialize)]
pub struct ImageChangeResponse {
    pub results: Vec<ImageChangeResult>,
}

/// POST /namespaces/{ns}/imagechanges
/// Fan a notification out to every BuildConfig watching the tag
pub async fn notify_image_change(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(notification): Json<ImageChangeNotification>,
) -> ApiResult<Json<ImageChangeResponse>> {
    tracing::info!(
        "Image change in {}: {} -> {}",
        ns,
        notification.from,
        notification.image
    );

    let results = trigger_service::notify_image_change(
        &state.store,
        &ns,
        &notification,
        state.conflict_retries,
        state.transient_backoff,
    )
    .await
    .map_err(|e| {
        if trigger_service::is_transient(&e) {
            return ApiError::Unavailable(e.to_string());
        }
        match e {
            TriggerError::InvalidPayload(msg) => ApiError::BadRequest(msg),
            TriggerError::Store(err) => ApiError::from(err),
            other => ApiError::InternalError(other.to_string()),
        }
    })?;

    Ok(Json(ImageChangeResponse { results }))
}
