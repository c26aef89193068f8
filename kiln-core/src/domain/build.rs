//! Build domain types
//!
//! A Build is one concrete execution derived from a BuildConfig. Its spec is a
//! snapshot taken at creation and never changes afterwards; only the status
//! moves, driven by the lifecycle controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::build_config::{BuildConfig, ImageStreamTag, RunPolicy};
use crate::domain::meta::{ObjectKey, ObjectMeta};
use crate::domain::strategy::{Output, Source, Strategy};

/// Build execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub metadata: ObjectMeta,
    pub spec: BuildSpec,
    pub status: BuildStatus,
}

impl Build {
    /// Creates a build in the `New` phase
    pub fn new(metadata: ObjectMeta, spec: BuildSpec) -> Self {
        let status = BuildStatus::new(metadata.creation_timestamp);
        Self {
            metadata,
            spec,
            status,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

/// Resolved snapshot of what to build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub strategy: Strategy,
    pub source: Source,
    pub output: Output,

    /// Commit that caused the build, when the event supplied one
    #[serde(default)]
    pub revision: Option<SourceRevision>,

    /// BuildConfig this build was created from
    #[serde(default)]
    pub config: Option<ObjectKey>,

    pub cause: TriggerCause,

    #[serde(default)]
    pub run_policy: RunPolicy,
}

impl BuildSpec {
    /// Renders a spec from a BuildConfig template without overrides
    pub fn from_template(config: &BuildConfig, cause: TriggerCause) -> Self {
        Self {
            strategy: config.spec.strategy.clone(),
            source: config.spec.source.clone(),
            output: config.spec.output.clone(),
            revision: None,
            config: Some(config.key()),
            cause,
            run_policy: config.spec.run_policy.clone(),
        }
    }
}

/// Commit information supplied by a source-control event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRevision {
    pub commit: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Audit record of the event that created a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCause {
    #[serde(rename = "github")]
    GitHubWebhook {
        #[serde(default)]
        revision: Option<SourceRevision>,
    },

    #[serde(rename = "generic")]
    GenericWebhook {
        #[serde(default)]
        revision: Option<SourceRevision>,
    },

    ImageChange {
        from: ImageStreamTag,
        image: String,
    },

    Manual {
        #[serde(default)]
        message: Option<String>,
    },
}

impl std::fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerCause::GitHubWebhook { .. } => write!(f, "GitHub webhook"),
            TriggerCause::GenericWebhook { .. } => write!(f, "Generic webhook"),
            TriggerCause::ImageChange { from, image } => {
                write!(f, "Image change of {} to {}", from, image)
            }
            TriggerCause::Manual { .. } => write!(f, "Manually triggered"),
        }
    }
}

/// Build lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildPhase {
    New,
    Pending,
    Running,
    Complete,
    Failed,
    Error,
    Cancelled,
}

impl BuildPhase {
    /// Terminal phases accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildPhase::Complete | BuildPhase::Failed | BuildPhase::Error | BuildPhase::Cancelled
        )
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildPhase::New => write!(f, "New"),
            BuildPhase::Pending => write!(f, "Pending"),
            BuildPhase::Running => write!(f, "Running"),
            BuildPhase::Complete => write!(f, "Complete"),
            BuildPhase::Failed => write!(f, "Failed"),
            BuildPhase::Error => write!(f, "Error"),
            BuildPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Machine-readable explanation of a non-successful terminal phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReason {
    /// The build itself failed (non-zero exit)
    ExecutionFailure,
    /// The executor reported or suffered an infrastructure fault
    InfrastructureError,
    /// Builder image or output could not be resolved
    PrepareFailed,
    /// The executor could not be asked to start the build
    StartFailed,
    PendingTimeout,
    RunningTimeout,
    CancelledBuild,
}

/// Mutable part of a Build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub phase: BuildPhase,

    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,

    /// Set exactly when the phase is terminal
    #[serde(default)]
    pub completion_timestamp: Option<DateTime<Utc>>,

    /// When the phase last changed
    pub last_transition: DateTime<Utc>,

    #[serde(default)]
    pub reason: Option<StatusReason>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Executor handle of the running execution
    #[serde(default)]
    pub execution: Option<String>,

    #[serde(default)]
    pub duration_secs: Option<i64>,
}

impl BuildStatus {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: BuildPhase::New,
            start_timestamp: None,
            completion_timestamp: None,
            last_transition: now,
            reason: None,
            message: None,
            exit_code: None,
            execution: None,
            duration_secs: None,
        }
    }
}
