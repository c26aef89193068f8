//! Strategy Dispatcher
//!
//! Turns a Build's resolved snapshot into an execution request for the
//! executor, and executor callbacks into lifecycle events.

use kiln_core::ValidationError;
use kiln_core::domain::build::Build;
use kiln_core::domain::image::ImageReference;
use kiln_core::domain::strategy::{Output, Strategy};
use kiln_core::dto::execution::{ExecutionRequest, ExecutorEvent};
use std::sync::Arc;
use thiserror::Error;

use crate::controller::lifecycle::LifecycleEvent;
use crate::executor::{Executor, ExecutorError};

/// Dispatch error type
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid {role} image: {source}")]
    InvalidImage {
        role: &'static str,
        source: ValidationError,
    },

    #[error("output must set exactly one of an image repository or an image reference")]
    AmbiguousOutput,

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    default_registry: String,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn Executor>, default_registry: impl Into<String>) -> Self {
        Self {
            executor,
            default_registry: default_registry.into(),
        }
    }

    /// Resolves images and output for a build
    pub fn prepare(&self, build: &Build) -> Result<ExecutionRequest, DispatchError> {
        let spec = &build.spec;
        let builder_image = self.qualify("builder", spec.strategy.builder_image())?;

        let base_image = match &spec.strategy {
            Strategy::SourceToImage { base_image, .. } => base_image
                .as_ref()
                .map(|base| self.qualify("base", &base.reference()))
                .transpose()?,
            Strategy::ContainerImage { .. } | Strategy::Custom { .. } => None,
        };

        Ok(ExecutionRequest {
            build: build.key(),
            strategy: spec.strategy.kind(),
            builder_image,
            base_image,
            source: spec.source.clone(),
            revision: spec.revision.clone(),
            output_image: resolve_output(&spec.output)?,
        })
    }

    pub async fn start(&self, request: &ExecutionRequest) -> Result<String, ExecutorError> {
        self.executor.start(request).await
    }

    pub async fn cancel(&self, handle: &str) -> Result<(), ExecutorError> {
        self.executor.cancel(handle).await
    }

    fn qualify(&self, role: &'static str, reference: &str) -> Result<String, DispatchError> {
        ImageReference::parse(reference)
            .map(|image| image.qualified(&self.default_registry))
            .map_err(|source| DispatchError::InvalidImage { role, source })
    }
}

/// Maps an executor callback onto the lifecycle
pub fn translate(event: &ExecutorEvent) -> LifecycleEvent {
    match event {
        ExecutorEvent::Started => LifecycleEvent::Started,
        ExecutorEvent::Completed { exit_code: 0 } => LifecycleEvent::Completed,
        ExecutorEvent::Completed { exit_code } => LifecycleEvent::Failed {
            exit_code: *exit_code,
        },
        ExecutorEvent::Aborted { message } => LifecycleEvent::InfrastructureFailure(
            message
                .clone()
                .unwrap_or_else(|| "execution aborted by the executor".to_string()),
        ),
    }
}

/// Resolves the image a build pushes
///
/// An image repository renders as `repository[:tag]`; a raw image reference
/// is used verbatim.
pub fn resolve_output(output: &Output) -> Result<String, DispatchError> {
    match (&output.to, &output.image_reference) {
        (Some(to), None) => Ok(match &to.tag {
            Some(tag) => format!("{}:{}", to.repository, tag),
            None => to.repository.clone(),
        }),
        (None, Some(reference)) => Ok(reference.clone()),
        (Some(_), Some(_)) | (None, None) => Err(DispatchError::AmbiguousOutput),
    }
}
