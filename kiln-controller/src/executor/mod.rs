//! Executor Module
//!
//! The external build executor runs strategy payloads; Kiln only asks it to
//! start and abort executions. [`InFlight`] tracks the handles this instance
//! started so it can abort them when their build ends early.

pub mod http;

use async_trait::async_trait;
use kiln_core::domain::meta::ObjectKey;
use kiln_core::dto::execution::ExecutionRequest;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

pub use http::HttpExecutor;

/// Executor error type
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor unreachable: {0}")]
    Unreachable(String),

    #[error("executor rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ExecutorError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::Unreachable(_) => true,
            ExecutorError::Rejected { status, .. } => *status >= 500,
        }
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        ExecutorError::Unreachable(err.to_string())
    }
}

/// Interface to the external build executor
#[async_trait]
pub trait Executor: Send + Sync {
    /// Starts an execution and returns its opaque handle
    async fn start(&self, request: &ExecutionRequest) -> Result<String, ExecutorError>;

    /// Asks the executor to abort an execution
    async fn cancel(&self, handle: &str) -> Result<(), ExecutorError>;
}

/// Executions started by this instance, by build
#[derive(Debug, Default)]
pub struct InFlight {
    handles: Mutex<HashMap<ObjectKey, String>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, String>> {
        // The map stays consistent even if a holder panicked
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, key: ObjectKey, handle: String) {
        self.handles().insert(key, handle);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<String> {
        self.handles().get(key).cloned()
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<String> {
        self.handles().remove(key)
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
