//! Shared test fixtures

use async_trait::async_trait;
use kiln_core::domain::build::{Build, BuildPhase, BuildSpec, TriggerCause};
use kiln_core::domain::build_config::{
    BuildConfig, BuildConfigSpec, BuildConfigStatus, ImageStreamTag, RunPolicy, Secret, Trigger,
};
use kiln_core::domain::meta::{BUILD_CONFIG_LABEL, ObjectKey, ObjectMeta};
use kiln_core::domain::strategy::{ImageRepositoryRef, Output, Source, Strategy};
use kiln_core::dto::execution::ExecutionRequest;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::executor::{Executor, ExecutorError};
use crate::repository::Store;
use crate::retry::Backoff;

/// BuildConfig `name`: source-to-image from `ruby:2.2`, git ref `main`, with a
/// GitHub trigger (secret `abc123`), a generic trigger (`generic-secret`) and
/// an image-change trigger on `ruby:2.2`
pub fn build_config(namespace: &str, name: &str) -> BuildConfig {
    BuildConfig {
        metadata: ObjectMeta::new(namespace, name),
        spec: BuildConfigSpec {
            strategy: Strategy::SourceToImage {
                builder_image: "ruby:2.2".to_string(),
                base_image: None,
            },
            source: Source::Git {
                uri: "https://example/app.git".to_string(),
                git_ref: Some("main".to_string()),
            },
            output: Output {
                to: Some(ImageRepositoryRef {
                    repository: format!("registry.local/{}/{}", namespace, name),
                    tag: Some("latest".to_string()),
                }),
                image_reference: None,
            },
            triggers: vec![
                Trigger::GitHubWebhook {
                    secret: Secret::new("abc123"),
                },
                Trigger::GenericWebhook {
                    secret: Secret::new("generic-secret"),
                },
                Trigger::ImageChange {
                    from: ImageStreamTag::new("ruby", "2.2"),
                    last_triggered_image: None,
                    last_triggered_build: None,
                },
            ],
            run_policy: RunPolicy::default(),
        },
        status: BuildConfigStatus::default(),
    }
}

/// A `New` build rendered from `build_config(namespace, "app")`
pub fn new_build(namespace: &str, name: &str) -> Build {
    let config = build_config(namespace, "app");
    let spec = BuildSpec::from_template(&config, TriggerCause::Manual { message: None });
    let metadata = ObjectMeta::new(namespace, name).with_label(BUILD_CONFIG_LABEL, "app");
    Build::new(metadata, spec)
}

/// GitHub push event body for `branch` at `commit`
pub fn github_push(branch: &str, commit: &str) -> Vec<u8> {
    serde_json::json!({
        "ref": format!("refs/heads/{}", branch),
        "after": commit,
        "head_commit": {
            "id": commit,
            "message": "Update app",
            "author": { "name": "Dev", "email": "dev@example.com" }
        }
    })
    .to_string()
    .into_bytes()
}

/// Controller settings with short waits
pub fn controller_config() -> ControllerConfig {
    ControllerConfig {
        namespace: String::new(),
        workers: 4,
        resync_interval: Duration::from_secs(30),
        pending_timeout: Duration::from_secs(600),
        running_timeout: Duration::from_secs(3600),
        conflict_retries: 3,
        transient_backoff: Backoff::new(3).with_initial(Duration::from_millis(1)),
    }
}

/// Polls until the build reaches `phase` and satisfies `ready`
pub async fn wait_for_phase(
    store: &Store,
    key: &ObjectKey,
    phase: BuildPhase,
    ready: impl Fn(&Build) -> bool,
) -> Build {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(build) = store.get::<Build>(key).await.unwrap() {
            if build.object.status.phase == phase && ready(&build.object) {
                return build.object;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "build {} never reached {}",
            key,
            phase
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Executor that records requests and hands out `exec-N` handles
#[derive(Default)]
pub struct FakeExecutor {
    started: Mutex<Vec<ExecutionRequest>>,
    cancelled: Mutex<Vec<String>>,
    next: AtomicUsize,
    fail_starts: AtomicBool,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every start fail as unreachable
    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<ExecutionRequest> {
        self.started.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn start(&self, request: &ExecutionRequest) -> Result<String, ExecutorError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(ExecutorError::Unreachable("connection refused".to_string()));
        }
        self.started.lock().unwrap().push(request.clone());
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("exec-{}", n))
    }

    async fn cancel(&self, handle: &str) -> Result<(), ExecutorError> {
        self.cancelled.lock().unwrap().push(handle.to_string());
        Ok(())
    }
}
