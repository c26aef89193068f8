//! BuildConfig domain types
//!
//! A BuildConfig is a named template describing how to build (strategy, source,
//! output) and when to build (triggers). The control plane only ever writes
//! its build counter and the image-change bookkeeping on its triggers.

use serde::{Deserialize, Serialize};

use crate::domain::meta::{ObjectKey, ObjectMeta};
use crate::domain::strategy::{Output, Source, Strategy};

const REDACTED: &str = "<redacted>";

/// BuildConfig template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub metadata: ObjectMeta,
    pub spec: BuildConfigSpec,
    #[serde(default)]
    pub status: BuildConfigStatus,
}

impl BuildConfig {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Copy suitable for returning to callers: webhook secrets are masked
    pub fn redacted(&self) -> BuildConfig {
        let mut config = self.clone();
        for trigger in &mut config.spec.triggers {
            match trigger {
                Trigger::GitHubWebhook { secret } | Trigger::GenericWebhook { secret } => {
                    *secret = Secret::new(REDACTED);
                }
                Trigger::ImageChange { .. } | Trigger::Unspecified => {}
            }
        }
        config
    }
}

/// Template part of a BuildConfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfigSpec {
    pub strategy: Strategy,
    pub source: Source,
    pub output: Output,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub run_policy: RunPolicy,
}

/// Observed state of a BuildConfig
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfigStatus {
    /// Counter of the last build created from this config
    pub last_version: u64,
}

/// Per-config overrides of the controller's phase timeouts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPolicy {
    #[serde(default)]
    pub pending_timeout_secs: Option<u64>,
    #[serde(default)]
    pub running_timeout_secs: Option<u64>,
}

/// A rule that causes a new Build when a matching event arrives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    #[serde(rename = "github")]
    GitHubWebhook { secret: Secret },

    #[serde(rename = "generic")]
    GenericWebhook { secret: Secret },

    ImageChange {
        from: ImageStreamTag,
        /// Image reference that last fired this trigger
        #[serde(default)]
        last_triggered_image: Option<String>,
        /// Build number reserved when `last_triggered_image` was recorded
        #[serde(default)]
        last_triggered_build: Option<u64>,
    },

    /// Trigger types this version does not understand
    #[serde(other)]
    Unspecified,
}

impl Trigger {
    pub fn kind(&self) -> Option<TriggerKind> {
        match self {
            Trigger::GitHubWebhook { .. } => Some(TriggerKind::GitHubWebhook),
            Trigger::GenericWebhook { .. } => Some(TriggerKind::GenericWebhook),
            Trigger::ImageChange { .. } => Some(TriggerKind::ImageChange),
            Trigger::Unspecified => None,
        }
    }

    /// The configured secret for webhook triggers
    pub fn secret(&self) -> Option<&Secret> {
        match self {
            Trigger::GitHubWebhook { secret } | Trigger::GenericWebhook { secret } => Some(secret),
            Trigger::ImageChange { .. } | Trigger::Unspecified => None,
        }
    }
}

/// Trigger variant without its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[serde(rename = "github")]
    GitHubWebhook,
    #[serde(rename = "generic")]
    GenericWebhook,
    ImageChange,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::GitHubWebhook => write!(f, "github"),
            TriggerKind::GenericWebhook => write!(f, "generic"),
            TriggerKind::ImageChange => write!(f, "image_change"),
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(TriggerKind::GitHubWebhook),
            "generic" => Ok(TriggerKind::GenericWebhook),
            "image_change" => Ok(TriggerKind::ImageChange),
            other => Err(format!("unknown trigger kind: {}", other)),
        }
    }
}

/// Image stream name and tag watched by an image-change trigger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageStreamTag {
    pub stream: String,
    pub tag: String,
}

impl ImageStreamTag {
    pub fn new(stream: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            tag: tag.into(),
        }
    }
}

impl std::fmt::Display for ImageStreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.stream, self.tag)
    }
}

/// Opaque webhook secret
///
/// Never printed by `Debug`; compare it only through a constant-time check.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({})", REDACTED)
    }
}
