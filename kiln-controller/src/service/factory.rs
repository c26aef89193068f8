//! Build Factory
//!
//! Materializes Build objects. The build number comes from the BuildConfig's
//! counter, reserved with a compare-and-swap, so concurrent callers for one
//! config always get distinct names.
//!
//! A caller may also reserve the number itself, together with other config
//! changes, and create the build later under that number with
//! [`create_reserved_build`]; repeating that create is harmless.

use kiln_core::domain::build::{Build, BuildSpec};
use kiln_core::domain::build_config::BuildConfig;
use kiln_core::domain::meta::{BUILD_CONFIG_LABEL, ObjectKey, ObjectMeta};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::repository::{Store, StoreError, Versioned};

/// Factory error type
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("build config {0} not found")]
    NotFound(ObjectKey),

    #[error("gave up creating a build for {0} after repeated conflicts")]
    Conflict(ObjectKey),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FactoryError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            FactoryError::Store(e) => e.is_transient(),
            FactoryError::NotFound(_) | FactoryError::Conflict(_) => false,
        }
    }
}

/// Creates a new Build in phase `New` for the given config
///
/// If the chosen name is already taken the counter is advanced again; a
/// number is never reused.
pub async fn create_build(
    store: &Store,
    config_key: &ObjectKey,
    spec: BuildSpec,
    retries: u32,
) -> Result<Versioned<Build>, FactoryError> {
    for attempt in 1..=retries + 1 {
        let number = reserve_build_number(store, config_key, retries).await?;
        let build = numbered_build(config_key, number, spec.clone());

        match store.create(&build).await {
            Ok(created) => {
                info!("Build created: {} ({})", created.object.key(), spec.cause);
                return Ok(created);
            }
            Err(StoreError::AlreadyExists { key, .. }) => {
                warn!(
                    "Build {} already exists (attempt {}), reserving a new number",
                    key, attempt
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(FactoryError::Conflict(config_key.clone()))
}

/// Creates the build for a number the caller already reserved
///
/// Returns `None` if that build already exists with the same cause, i.e. an
/// earlier attempt got there first. A build of that name with another cause is
/// left over from an earlier incarnation of the config; a fresh number is
/// reserved instead.
pub async fn create_reserved_build(
    store: &Store,
    config_key: &ObjectKey,
    number: u64,
    spec: BuildSpec,
    retries: u32,
) -> Result<Option<Versioned<Build>>, FactoryError> {
    let build = numbered_build(config_key, number, spec.clone());

    match store.create(&build).await {
        Ok(created) => {
            info!("Build created: {} ({})", created.object.key(), spec.cause);
            Ok(Some(created))
        }
        Err(StoreError::AlreadyExists { key, .. }) => {
            let existing = store.get::<Build>(&key).await?;
            match existing {
                Some(existing) if existing.object.spec.cause == spec.cause => {
                    debug!("Build {} was already created", key);
                    Ok(None)
                }
                _ => {
                    warn!("Build {} is taken by an unrelated build, reserving a new number", key);
                    create_build(store, config_key, spec, retries).await.map(Some)
                }
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn numbered_build(config_key: &ObjectKey, number: u64, spec: BuildSpec) -> Build {
    let metadata = ObjectMeta::new(
        config_key.namespace.clone(),
        build_name(&config_key.name, number),
    )
    .with_label(BUILD_CONFIG_LABEL, config_key.name.clone());
    Build::new(metadata, spec)
}

/// Increments the config's build counter and returns the new value
pub async fn reserve_build_number(
    store: &Store,
    config_key: &ObjectKey,
    retries: u32,
) -> Result<u64, FactoryError> {
    for attempt in 1..=retries + 1 {
        let current = store
            .get::<BuildConfig>(config_key)
            .await?
            .ok_or_else(|| FactoryError::NotFound(config_key.clone()))?;

        let mut config = current.object;
        config.status.last_version += 1;
        let number = config.status.last_version;

        match store.update(&config, current.version).await {
            Ok(_) => return Ok(number),
            Err(StoreError::Conflict { .. }) => {
                debug!(
                    "Conflict reserving build number for {} (attempt {})",
                    config_key, attempt
                );
            }
            Err(StoreError::NotFound { .. }) => {
                return Err(FactoryError::NotFound(config_key.clone()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(FactoryError::Conflict(config_key.clone()))
}

pub fn build_name(config_name: &str, number: u64) -> String {
    format!("{}-{}", config_name, number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::testing::{build_config, new_build};
    use kiln_core::domain::build::{BuildPhase, TriggerCause};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn store() -> Store {
        Store::new(Arc::new(MemoryStore::new()))
    }

    fn manual_spec(config: &BuildConfig) -> BuildSpec {
        BuildSpec::from_template(config, TriggerCause::Manual { message: None })
    }

    #[tokio::test]
    async fn test_create_build_numbers_sequentially() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        let first = create_build(&store, &config.key(), manual_spec(&config), 3)
            .await
            .unwrap();
        let second = create_build(&store, &config.key(), manual_spec(&config), 3)
            .await
            .unwrap();

        assert_eq!(first.object.metadata.name, "app-1");
        assert_eq!(second.object.metadata.name, "app-2");
        assert_eq!(first.object.status.phase, BuildPhase::New);
        assert!(first.object.status.start_timestamp.is_none());
        assert_eq!(
            first.object.metadata.labels.get(BUILD_CONFIG_LABEL).map(String::as_str),
            Some("app")
        );

        let stored: Versioned<BuildConfig> = store.get_required(&config.key()).await.unwrap();
        assert_eq!(stored.object.status.last_version, 2);
    }

    #[tokio::test]
    async fn test_existing_name_is_skipped() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        // Left over from an earlier incarnation of the config
        store.create(&new_build("ci", "app-1")).await.unwrap();

        let created = create_build(&store, &config.key(), manual_spec(&config), 3)
            .await
            .unwrap();
        assert_eq!(created.object.metadata.name, "app-2");
    }

    #[tokio::test]
    async fn test_missing_config() {
        let store = store();
        let config = build_config("ci", "app");
        let err = create_build(&store, &config.key(), manual_spec(&config), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reserved_build_is_created_once() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();
        let number = reserve_build_number(&store, &config.key(), 3).await.unwrap();

        let created = create_reserved_build(&store, &config.key(), number, manual_spec(&config), 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.object.metadata.name, "app-1");

        // Repeating the create is a no-op
        let again = create_reserved_build(&store, &config.key(), number, manual_spec(&config), 3)
            .await
            .unwrap();
        assert!(again.is_none());

        let (builds, _) = store.list::<Build>("ci").await.unwrap();
        assert_eq!(builds.len(), 1);
    }

    #[tokio::test]
    async fn test_reserved_name_taken_by_leftover() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();
        store.create(&new_build("ci", "app-1")).await.unwrap();
        let number = reserve_build_number(&store, &config.key(), 3).await.unwrap();

        let spec = BuildSpec::from_template(
            &config,
            TriggerCause::Manual {
                message: Some("redo".to_string()),
            },
        );
        let created = create_reserved_build(&store, &config.key(), number, spec, 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.object.metadata.name, "app-2");
    }

    #[test]
    fn test_transient_errors() {
        assert!(FactoryError::Store(StoreError::Unavailable("reset".into())).is_transient());
        assert!(!FactoryError::NotFound(ObjectKey::new("ci", "app")).is_transient());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_distinct_names() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move {
                create_build(&store, &config.key(), manual_spec(&config), 100).await
            }));
        }

        let mut names = HashSet::new();
        for task in tasks {
            let build = task.await.unwrap().unwrap();
            assert!(names.insert(build.object.metadata.name));
        }
        assert_eq!(names.len(), 16);

        let stored: Versioned<BuildConfig> = store.get_required(&config.key()).await.unwrap();
        assert_eq!(stored.object.status.last_version, 16);
    }
}
