//! Webhook API Handler
//!
//! Every rejection (unknown config, unknown kind, bad secret, no trigger of
//! the kind) produces the same response so callers cannot discover configs
//! or secrets.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use kiln_core::domain::build_config::TriggerKind;
use kiln_core::domain::meta::ObjectKey;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::trigger_service::{self, TriggerError, WebhookEvent};

const GITHUB_EVENT_HEADER: &str = "x-github-event";

/// POST /namespaces/{ns}/buildconfigs/{name}/webhooks/{secret}/{kind}
/// Evaluate a webhook and create a build when it matches
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path((ns, name, secret, kind)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let key = ObjectKey::new(ns, name);

    let Ok(kind) = kind.parse::<TriggerKind>() else {
        tracing::warn!("Webhook for {} rejected: unknown kind", key);
        return Err(ApiError::webhook_rejected());
    };
    if kind == TriggerKind::ImageChange {
        tracing::warn!("Webhook for {} rejected: image_change is not a webhook", key);
        return Err(ApiError::webhook_rejected());
    }

    let event = WebhookEvent {
        kind,
        secret,
        github_event: headers
            .get(GITHUB_EVENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.to_vec(),
    };

    match trigger_service::trigger_webhook(&state.store, &key, &event, state.conflict_retries).await
    {
        Ok(build) => Ok((StatusCode::ACCEPTED, Json(json!({ "build": build })))),
        Err(TriggerError::Skipped(reason)) => {
            tracing::debug!("Webhook for {} skipped: {}", key, reason);
            Ok((StatusCode::OK, Json(json!({ "status": "skipped" }))))
        }
        Err(e) => Err(map_trigger_error(&key, kind, e)),
    }
}

fn map_trigger_error(key: &ObjectKey, kind: TriggerKind, err: TriggerError) -> ApiError {
    if trigger_service::is_transient(&err) {
        return ApiError::Unavailable(err.to_string());
    }

    match err {
        TriggerError::Authentication
        | TriggerError::NoMatchingTrigger
        | TriggerError::NotFound(_) => {
            tracing::warn!("{} webhook for {} rejected: {}", kind, key, err);
            ApiError::webhook_rejected()
        }
        TriggerError::InvalidPayload(msg) => ApiError::BadRequest(msg),
        // Never produced for webhooks; skips are answered before mapping
        other @ (TriggerError::StaleNotification(_) | TriggerError::Skipped(_)) => {
            ApiError::InternalError(other.to_string())
        }
        TriggerError::Transient(msg) => ApiError::Unavailable(msg),
        TriggerError::Store(e) => ApiError::from(e),
    }
}
