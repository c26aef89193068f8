//! BuildConfig Service
//!
//! Creation with validation, and secret-free reads.

use kiln_core::domain::build_config::{BuildConfig, BuildConfigSpec, BuildConfigStatus, Trigger};
use kiln_core::domain::image::ImageReference;
use kiln_core::domain::meta::{ObjectKey, ObjectMeta, validate_name};
use kiln_core::domain::strategy::Strategy;
use kiln_core::dto::build::CreateBuildConfig;

use crate::repository::{Store, StoreError};
use crate::service::dispatcher::resolve_output;

/// Service error type
#[derive(Debug)]
pub enum BuildConfigError {
    NotFound(ObjectKey),
    AlreadyExists(ObjectKey),
    ValidationError(String),
    StoreError(StoreError),
}

impl From<StoreError> for BuildConfigError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists { key, .. } => BuildConfigError::AlreadyExists(key),
            other => BuildConfigError::StoreError(other),
        }
    }
}

/// Validate and store a new BuildConfig
pub async fn create_build_config(
    store: &Store,
    namespace: &str,
    req: CreateBuildConfig,
) -> Result<BuildConfig, BuildConfigError> {
    validate_name(namespace).map_err(|e| BuildConfigError::ValidationError(e.to_string()))?;
    validate_name(&req.name).map_err(|e| BuildConfigError::ValidationError(e.to_string()))?;
    validate_spec(&req.spec)?;

    let config = BuildConfig {
        metadata: ObjectMeta::new(namespace, req.name),
        spec: req.spec,
        status: BuildConfigStatus::default(),
    };

    let created = store.create(&config).await?;
    tracing::info!("BuildConfig created: {}", created.object.key());

    Ok(created.object.redacted())
}

fn validate_spec(spec: &BuildConfigSpec) -> Result<(), BuildConfigError> {
    let invalid = |msg: String| BuildConfigError::ValidationError(msg);

    ImageReference::parse(spec.strategy.builder_image()).map_err(|e| invalid(e.to_string()))?;

    match &spec.strategy {
        Strategy::SourceToImage {
            base_image: Some(base),
            ..
        } => {
            ImageReference::parse(&base.reference()).map_err(|e| invalid(e.to_string()))?;
        }
        Strategy::SourceToImage { base_image: None, .. }
        | Strategy::ContainerImage { .. }
        | Strategy::Custom { .. } => {}
    }

    resolve_output(&spec.output).map_err(|e| invalid(e.to_string()))?;

    for trigger in &spec.triggers {
        match trigger {
            Trigger::GitHubWebhook { secret } | Trigger::GenericWebhook { secret } => {
                if secret.is_empty() {
                    return Err(invalid("webhook triggers need a non-empty secret".to_string()));
                }
            }
            Trigger::ImageChange { from, .. } => {
                if from.stream.is_empty() || from.tag.is_empty() {
                    return Err(invalid(
                        "image change triggers need a stream and a tag".to_string(),
                    ));
                }
            }
            Trigger::Unspecified => {
                return Err(invalid("unsupported trigger type".to_string()));
            }
        }
    }

    Ok(())
}

/// Get a BuildConfig with webhook secrets masked
pub async fn get_build_config(store: &Store, key: &ObjectKey) -> Result<BuildConfig, BuildConfigError> {
    let config = store
        .get::<BuildConfig>(key)
        .await?
        .ok_or_else(|| BuildConfigError::NotFound(key.clone()))?;

    Ok(config.object.redacted())
}

/// List BuildConfigs in a namespace with webhook secrets masked
pub async fn list_build_configs(
    store: &Store,
    namespace: &str,
) -> Result<Vec<BuildConfig>, BuildConfigError> {
    let (configs, _) = store.list::<BuildConfig>(namespace).await?;
    Ok(configs.into_iter().map(|c| c.object.redacted()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::testing::build_config;
    use kiln_core::domain::build_config::Secret;
    use std::sync::Arc;

    fn store() -> Store {
        Store::new(Arc::new(MemoryStore::new()))
    }

    fn request(name: &str) -> CreateBuildConfig {
        CreateBuildConfig {
            name: name.to_string(),
            spec: build_config("ci", name).spec,
        }
    }

    #[tokio::test]
    async fn test_create_and_read_back_redacted() {
        let store = store();
        let created = create_build_config(&store, "ci", request("app")).await.unwrap();
        assert_eq!(created.status.last_version, 0);

        let fetched = get_build_config(&store, &ObjectKey::new("ci", "app")).await.unwrap();
        let json = serde_json::to_string(&fetched).unwrap();
        assert!(!json.contains("abc123"));

        let listed = list_build_configs(&store, "ci").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_is_rejected() {
        let store = store();
        create_build_config(&store, "ci", request("app")).await.unwrap();
        let err = create_build_config(&store, "ci", request("app")).await.unwrap_err();
        assert!(matches!(err, BuildConfigError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_validation() {
        let store = store();

        let err = create_build_config(&store, "ci", request("App")).await.unwrap_err();
        assert!(matches!(err, BuildConfigError::ValidationError(_)));

        let mut bad_output = request("app");
        bad_output.spec.output.image_reference = Some("quay.io/org/app".to_string());
        let err = create_build_config(&store, "ci", bad_output).await.unwrap_err();
        assert!(matches!(err, BuildConfigError::ValidationError(_)));

        let mut empty_secret = request("app");
        empty_secret.spec.triggers = vec![Trigger::GenericWebhook {
            secret: Secret::new(""),
        }];
        let err = create_build_config(&store, "ci", empty_secret).await.unwrap_err();
        assert!(matches!(err, BuildConfigError::ValidationError(_)));

        let mut bad_builder = request("app");
        bad_builder.spec.strategy = Strategy::Custom {
            builder_image: "ruby:".to_string(),
        };
        let err = create_build_config(&store, "ci", bad_builder).await.unwrap_err();
        assert!(matches!(err, BuildConfigError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let err = get_build_config(&store(), &ObjectKey::new("ci", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildConfigError::NotFound(_)));
    }
}
