//! Build strategy, source and output descriptors
//!
//! These descriptors appear both in a BuildConfig template and, copied
//! verbatim or with event overrides, in a Build's resolved snapshot.

use serde::{Deserialize, Serialize};

/// How a build produces its output image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// Assemble application source on top of a builder image
    SourceToImage {
        builder_image: String,
        #[serde(default)]
        base_image: Option<BaseImage>,
    },

    /// Build from a container file using the given builder image
    ContainerImage { builder_image: String },

    /// Run an arbitrary builder image that is responsible for everything
    Custom { builder_image: String },
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::SourceToImage { .. } => StrategyKind::SourceToImage,
            Strategy::ContainerImage { .. } => StrategyKind::ContainerImage,
            Strategy::Custom { .. } => StrategyKind::Custom,
        }
    }

    pub fn builder_image(&self) -> &str {
        match self {
            Strategy::SourceToImage { builder_image, .. }
            | Strategy::ContainerImage { builder_image }
            | Strategy::Custom { builder_image } => builder_image,
        }
    }

    /// Returns a copy of this strategy using a different builder image
    pub fn with_builder_image(&self, image: impl Into<String>) -> Strategy {
        let image = image.into();
        match self {
            Strategy::SourceToImage { base_image, .. } => Strategy::SourceToImage {
                builder_image: image,
                base_image: base_image.clone(),
            },
            Strategy::ContainerImage { .. } => Strategy::ContainerImage {
                builder_image: image,
            },
            Strategy::Custom { .. } => Strategy::Custom {
                builder_image: image,
            },
        }
    }
}

/// Strategy variant without its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SourceToImage,
    ContainerImage,
    Custom,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::SourceToImage => write!(f, "source-to-image"),
            StrategyKind::ContainerImage => write!(f, "container-image"),
            StrategyKind::Custom => write!(f, "custom"),
        }
    }
}

/// Optional base image override for source-to-image builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImage {
    pub image: String,
    #[serde(default)]
    pub tag: Option<String>,
}

impl BaseImage {
    /// The image reference with the tag applied, if any
    pub fn reference(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}:{}", self.image, tag),
            None => self.image.clone(),
        }
    }
}

/// Where the build's input comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    Git {
        uri: String,
        #[serde(default, rename = "ref")]
        git_ref: Option<String>,
    },
    None,
}

impl Source {
    /// Returns a copy with the git ref replaced; non-git sources are unchanged
    pub fn with_ref(&self, new_ref: impl Into<String>) -> Source {
        match self {
            Source::Git { uri, .. } => Source::Git {
                uri: uri.clone(),
                git_ref: Some(new_ref.into()),
            },
            Source::None => Source::None,
        }
    }

    pub fn git_ref(&self) -> Option<&str> {
        match self {
            Source::Git { git_ref, .. } => git_ref.as_deref(),
            Source::None => None,
        }
    }
}

/// Where the produced image is pushed
///
/// Exactly one of `to` and `image_reference` is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub to: Option<ImageRepositoryRef>,

    #[serde(default)]
    pub image_reference: Option<String>,
}

/// An image repository destination, optionally tagged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRepositoryRef {
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
}
