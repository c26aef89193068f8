//! BuildConfig API Handlers
//!
//! HTTP endpoints for BuildConfig management and manual builds.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use kiln_core::domain::build_config::BuildConfig;
use kiln_core::domain::meta::ObjectKey;
use kiln_core::dto::build::{CreateBuildConfig, InstantiateBuild};
use serde_json::{Value, json};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::build_config_service::{self, BuildConfigError};
use crate::service::trigger_service::{self, TriggerError};

fn map_config_error(e: BuildConfigError) -> ApiError {
    match e {
        BuildConfigError::NotFound(key) => {
            ApiError::NotFound(format!("BuildConfig {} not found", key))
        }
        BuildConfigError::AlreadyExists(key) => {
            ApiError::Conflict(format!("BuildConfig {} already exists", key))
        }
        BuildConfigError::ValidationError(msg) => ApiError::BadRequest(msg),
        BuildConfigError::StoreError(err) => ApiError::from(err),
    }
}

/// POST /namespaces/{ns}/buildconfigs
/// Create a new BuildConfig
pub async fn create_build_config(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(req): Json<CreateBuildConfig>,
) -> ApiResult<(StatusCode, Json<BuildConfig>)> {
    tracing::info!("Creating BuildConfig: {}/{}", ns, req.name);

    let config = build_config_service::create_build_config(&state.store, &ns, req)
        .await
        .map_err(map_config_error)?;

    Ok((StatusCode::CREATED, Json(config)))
}

/// GET /namespaces/{ns}/buildconfigs
/// List BuildConfigs in a namespace
pub async fn list_build_configs(
    State(state): State<AppState>,
    Path(ns): Path<String>,
) -> ApiResult<Json<Vec<BuildConfig>>> {
    tracing::debug!("Listing BuildConfigs in {}", ns);

    let configs = build_config_service::list_build_configs(&state.store, &ns)
        .await
        .map_err(map_config_error)?;

    Ok(Json(configs))
}

/// GET /namespaces/{ns}/buildconfigs/{name}
/// Get a BuildConfig by name
pub async fn get_build_config(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<BuildConfig>> {
    let key = ObjectKey::new(ns, name);
    tracing::debug!("Getting BuildConfig: {}", key);

    let config = build_config_service::get_build_config(&state.store, &key)
        .await
        .map_err(map_config_error)?;

    Ok(Json(config))
}

/// POST /namespaces/{ns}/buildconfigs/{name}/instantiate
/// Start a build by hand; the body is optional
pub async fn instantiate(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let key = ObjectKey::new(ns, name);

    let req: InstantiateBuild = if body.iter().all(u8::is_ascii_whitespace) {
        InstantiateBuild::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let build = trigger_service::instantiate(&state.store, &key, req.message, state.conflict_retries)
        .await
        .map_err(|e| {
            if trigger_service::is_transient(&e) {
                return ApiError::Unavailable(e.to_string());
            }
            match e {
                TriggerError::NotFound(key) => {
                    ApiError::NotFound(format!("BuildConfig {} not found", key))
                }
                TriggerError::Store(err) => ApiError::from(err),
                other => ApiError::InternalError(other.to_string()),
            }
        })?;

    tracing::info!("Build {} instantiated from {}", build, key);
    Ok((StatusCode::CREATED, Json(json!({ "build": build }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support;
    use crate::testing::build_config;
    use kiln_core::domain::build::{Build, TriggerCause};
    use kiln_core::domain::build_config::Trigger;

    fn create_request(name: &str) -> Json<CreateBuildConfig> {
        Json(CreateBuildConfig {
            name: name.to_string(),
            spec: build_config("ci", name).spec,
        })
    }

    #[tokio::test]
    async fn test_create_and_get_redacts_secrets() {
        let (state, _controller) = test_support::state();

        let (status, Json(created)) =
            create_build_config(State(state.clone()), Path("ci".to_string()), create_request("app"))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let Json(fetched) = get_build_config(
            State(state.clone()),
            Path(("ci".to_string(), "app".to_string())),
        )
        .await
        .unwrap();

        for config in [&created, &fetched] {
            let json = serde_json::to_string(config).unwrap();
            assert!(!json.contains("abc123"));
            assert!(!json.contains("generic-secret"));
        }

        // The stored copy still holds the real secret
        let stored = state
            .store
            .get_required::<BuildConfig>(&ObjectKey::new("ci", "app"))
            .await
            .unwrap();
        assert!(matches!(
            &stored.object.spec.triggers[0],
            Trigger::GitHubWebhook { secret } if secret.as_bytes() == b"abc123"
        ));
    }

    #[tokio::test]
    async fn test_create_duplicate_is_conflict() {
        let (state, _controller) = test_support::state();
        create_build_config(State(state.clone()), Path("ci".to_string()), create_request("app"))
            .await
            .unwrap();

        let err =
            create_build_config(State(state.clone()), Path("ci".to_string()), create_request("app"))
                .await
                .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_build_configs() {
        let (state, _controller) = test_support::state();
        state.store.create(&build_config("ci", "app")).await.unwrap();
        state.store.create(&build_config("ci", "api")).await.unwrap();
        state.store.create(&build_config("prod", "app")).await.unwrap();

        let Json(configs) = list_build_configs(State(state), Path("ci".to_string()))
            .await
            .unwrap();
        assert_eq!(configs.len(), 2);
    }

    #[tokio::test]
    async fn test_instantiate_with_and_without_body() {
        let (state, _controller) = test_support::state();
        state.store.create(&build_config("ci", "app")).await.unwrap();
        let path = || Path(("ci".to_string(), "app".to_string()));

        let (status, Json(first)) = instantiate(State(state.clone()), path(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["build"], "app-1");

        let (_, Json(second)) = instantiate(
            State(state.clone()),
            path(),
            Bytes::from_static(b"{\"message\":\"rebuild\"}"),
        )
        .await
        .unwrap();
        assert_eq!(second["build"], "app-2");

        let build = state
            .store
            .get_required::<Build>(&ObjectKey::new("ci", "app-2"))
            .await
            .unwrap();
        assert_eq!(
            build.object.spec.cause,
            TriggerCause::Manual {
                message: Some("rebuild".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_instantiate_unknown_config() {
        let (state, _controller) = test_support::state();
        let err = instantiate(
            State(state),
            Path(("ci".to_string(), "nope".to_string())),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
