//! Build Service
//!
//! Read access to builds.

use kiln_core::domain::build::Build;
use kiln_core::domain::meta::{BUILD_CONFIG_LABEL, ObjectKey};

use crate::repository::{Store, StoreError};

/// Service error type
#[derive(Debug)]
pub enum BuildError {
    NotFound(ObjectKey),
    StoreError(StoreError),
}

impl From<StoreError> for BuildError {
    fn from(err: StoreError) -> Self {
        BuildError::StoreError(err)
    }
}

/// Get a build by key
pub async fn get_build(store: &Store, key: &ObjectKey) -> Result<Build, BuildError> {
    let build = store
        .get::<Build>(key)
        .await?
        .ok_or_else(|| BuildError::NotFound(key.clone()))?;

    Ok(build.object)
}

/// List builds in a namespace, optionally only those of one BuildConfig
///
/// Newest first.
pub async fn list_builds(
    store: &Store,
    namespace: &str,
    config: Option<&str>,
) -> Result<Vec<Build>, BuildError> {
    let (builds, _) = store.list::<Build>(namespace).await?;

    let mut builds: Vec<Build> = builds
        .into_iter()
        .map(|b| b.object)
        .filter(|b| {
            config.is_none_or(|name| {
                b.metadata.labels.get(BUILD_CONFIG_LABEL).map(String::as_str) == Some(name)
            })
        })
        .collect();
    builds.sort_by(|a, b| b.metadata.creation_timestamp.cmp(&a.metadata.creation_timestamp));

    Ok(builds)
}
