//! Executor DTOs
//!
//! Kiln never runs builds itself. It hands a fully resolved request to the
//! external executor and receives lifecycle callbacks in return.

use serde::{Deserialize, Serialize};

use crate::domain::build::SourceRevision;
use crate::domain::meta::ObjectKey;
use crate::domain::strategy::{Source, StrategyKind};

/// Fully resolved request sent to the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Build the execution belongs to; echoed back through callbacks
    pub build: ObjectKey,
    pub strategy: StrategyKind,
    /// Fully qualified builder image
    pub builder_image: String,
    /// Fully qualified base image override (source-to-image only)
    #[serde(default)]
    pub base_image: Option<String>,
    pub source: Source,
    #[serde(default)]
    pub revision: Option<SourceRevision>,
    /// Image the build pushes
    pub output_image: String,
}

/// Executor response to a start request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedExecution {
    pub handle: String,
}

/// Callback sent by the executor as an execution progresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorCallback {
    pub handle: String,
    pub event: ExecutorEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorEvent {
    /// The workload has started running
    Started,
    /// The workload finished; zero means success
    Completed { exit_code: i32 },
    /// The executor gave up on the workload
    Aborted {
        #[serde(default)]
        message: Option<String>,
    },
}
