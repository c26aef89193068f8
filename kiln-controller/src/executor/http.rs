//! HTTP executor client

use async_trait::async_trait;
use kiln_core::dto::execution::{ExecutionRequest, StartedExecution};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::{Executor, ExecutorError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Executor reached over HTTP
///
/// - `POST {base_url}/executions` with an [`ExecutionRequest`] returns `{"handle": ...}`
/// - `DELETE {base_url}/executions/{handle}` aborts an execution
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    base_url: String,
    client: Client,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ExecutorError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(base_url, client))
    }

    /// Uses a preconfigured reqwest client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExecutorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ExecutorError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn start(&self, request: &ExecutionRequest) -> Result<String, ExecutorError> {
        let url = format!("{}/executions", self.base_url);
        debug!("Starting execution for build {} at {}", request.build, url);

        let response = self.client.post(&url).json(request).send().await?;
        let started: StartedExecution = Self::check_status(response).await?.json().await?;
        Ok(started.handle)
    }

    async fn cancel(&self, handle: &str) -> Result<(), ExecutorError> {
        let url = format!("{}/executions/{}", self.base_url, handle);
        debug!("Aborting execution {}", handle);

        let response = self.client.delete(&url).send().await?;
        match response.status() {
            // Already gone
            reqwest::StatusCode::NOT_FOUND => Ok(()),
            _ => Self::check_status(response).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_trimmed() {
        let executor = HttpExecutor::new("http://executor:9090/").unwrap();
        assert_eq!(executor.base_url(), "http://executor:9090");
    }

    #[tokio::test]
    async fn test_unreachable_executor_is_transient() {
        // Port 9 (discard) is not expected to accept HTTP connections
        let executor = HttpExecutor::with_client(
            "http://127.0.0.1:9",
            Client::builder()
                .timeout(Duration::from_millis(500))
                .build()
                .unwrap(),
        );
        let err = executor.cancel("exec-1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
