//! Build and BuildConfig DTOs

use serde::{Deserialize, Serialize};

use crate::domain::build::{Build, BuildPhase};
use crate::domain::build_config::BuildConfigSpec;

/// Request to create a new BuildConfig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBuildConfig {
    pub name: String,
    pub spec: BuildConfigSpec,
}

/// Request to start a build by hand
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstantiateBuild {
    #[serde(default)]
    pub message: Option<String>,
}

/// Build summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub namespace: String,
    pub name: String,
    pub config: Option<String>,
    pub phase: BuildPhase,
    pub cause: String,
    pub creation_timestamp: chrono::DateTime<chrono::Utc>,
    pub start_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub completion_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Build> for BuildSummary {
    fn from(build: Build) -> Self {
        Self {
            namespace: build.metadata.namespace,
            name: build.metadata.name,
            config: build.spec.config.map(|key| key.name),
            phase: build.status.phase,
            cause: build.spec.cause.to_string(),
            creation_timestamp: build.metadata.creation_timestamp,
            start_timestamp: build.status.start_timestamp,
            completion_timestamp: build.status.completion_timestamp,
        }
    }
}
