//! Object identity shared by every stored kind

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::ValidationError;

/// Label placed on every Build naming the BuildConfig it was created from
pub const BUILD_CONFIG_LABEL: &str = "buildconfig";

const MAX_NAME_LEN: usize = 253;

/// Namespaced identity of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata carried by every stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,

    /// Distinguishes two objects that reused the same name over time
    pub uid: Uuid,

    pub creation_timestamp: DateTime<Utc>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Creates metadata for a brand new object
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: Uuid::new_v4(),
            creation_timestamp: Utc::now(),
            labels: BTreeMap::new(),
        }
    }

    /// Adds a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Validates a namespace or object name
///
/// Names are lowercase alphanumerics and '-', must start and end with an
/// alphanumeric and may not exceed 253 characters.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is too long (max 253 characters)"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(
            "name may only contain lowercase letters, digits and '-'",
        ));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("name must start and end with a letter or digit"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = ObjectKey::new("ci", "app");
        assert_eq!(key.to_string(), "ci/app");
    }

    #[test]
    fn test_meta_key_and_labels() {
        let meta = ObjectMeta::new("ci", "app-1").with_label(BUILD_CONFIG_LABEL, "app");
        assert_eq!(meta.key(), ObjectKey::new("ci", "app-1"));
        assert_eq!(meta.labels.get(BUILD_CONFIG_LABEL), Some(&"app".to_string()));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("app").is_ok());
        assert!(validate_name("ruby-app-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("App").is_err());
        assert!(validate_name("-app").is_err());
        assert!(validate_name("app_1").is_err());
        assert!(validate_name(&"a".repeat(254)).is_err());
    }
}
