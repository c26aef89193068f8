//! Inbound event payloads
//!
//! Webhook bodies from source-control systems and image-change notifications
//! from image registries.

use serde::{Deserialize, Serialize};

use crate::domain::build::SourceRevision;
use crate::domain::build_config::ImageStreamTag;

/// Body accepted by the generic webhook
///
/// The body is optional; when present it may point the build at a specific
/// ref and commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenericWebhookPayload {
    #[serde(default)]
    pub git: Option<GitInfo>,
}

/// Git information carried by a generic webhook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitInfo {
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl GitInfo {
    pub fn revision(&self) -> Option<SourceRevision> {
        self.commit.as_ref().map(|commit| SourceRevision {
            commit: commit.clone(),
            author: self.author.clone(),
            message: self.message.clone(),
        })
    }
}

/// The subset of a GitHub push event the trigger needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubPushEvent {
    /// Full ref that was pushed, e.g. `refs/heads/main`
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Commit the ref points at after the push
    pub after: String,

    #[serde(default)]
    pub head_commit: Option<GitHubCommit>,
}

impl GitHubPushEvent {
    /// Branch name of the pushed ref, if it is a branch
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    pub fn revision(&self) -> SourceRevision {
        let commit = self.head_commit.as_ref();
        SourceRevision {
            commit: self.after.clone(),
            author: commit
                .and_then(|c| c.author.as_ref())
                .map(|author| author.name.clone()),
            message: commit.map(|c| c.message.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: Option<GitHubUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubUser {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Notification that an image stream tag now points at a new image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageChangeNotification {
    pub from: ImageStreamTag,
    /// The new image reference, usually pinned by digest
    pub image: String,
}
