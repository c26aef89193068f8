//! Trigger Evaluator
//!
//! Decides whether an inbound event should produce a Build and renders the
//! Build spec from the BuildConfig template plus event overrides.
//!
//! Webhook secrets are compared in constant time against every trigger of the
//! requested kind. Image-change notifications record the image they fired for
//! and the build number they reserved on the trigger itself, with a
//! compare-and-swap, so that the same notification delivered twice (or to two
//! instances) builds once.

use kiln_core::domain::build::{Build, BuildSpec, SourceRevision, TriggerCause};
use kiln_core::domain::build_config::{BuildConfig, Trigger, TriggerKind};
use kiln_core::domain::image::ImageReference;
use kiln_core::domain::meta::ObjectKey;
use kiln_core::dto::webhook::{GenericWebhookPayload, GitHubPushEvent, ImageChangeNotification};
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repository::{Store, StoreError, Versioned};
use crate::retry::{Backoff, with_backoff};
use crate::service::factory::{self, FactoryError};

const GITHUB_PUSH: &str = "push";
const GITHUB_PING: &str = "ping";

/// Trigger error type
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("webhook secret does not match any trigger")]
    Authentication,

    #[error("no trigger matches the event")]
    NoMatchingTrigger,

    #[error("image {0} already triggered a build")]
    StaleNotification(String),

    #[error("event skipped: {0}")]
    Skipped(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("build config {0} not found")]
    NotFound(ObjectKey),

    #[error("temporarily unable to evaluate trigger: {0}")]
    Transient(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<FactoryError> for TriggerError {
    fn from(err: FactoryError) -> Self {
        match err {
            FactoryError::NotFound(key) => TriggerError::NotFound(key),
            FactoryError::Conflict(key) => {
                TriggerError::Transient(format!("too many concurrent writers on {}", key))
            }
            FactoryError::Store(err) => TriggerError::Store(err),
        }
    }
}

/// An inbound webhook request
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub kind: TriggerKind,
    pub secret: String,
    /// Value of the `X-GitHub-Event` header, if sent
    pub github_event: Option<String>,
    pub body: Vec<u8>,
}

/// Authenticates a webhook against a config and renders the build spec
pub fn evaluate_webhook(config: &BuildConfig, event: &WebhookEvent) -> Result<BuildSpec, TriggerError> {
    authenticate(config, event.kind, &event.secret)?;

    let (git_ref, revision, cause) = match event.kind {
        TriggerKind::GitHubWebhook => {
            let push = parse_github(event)?;
            let branch = push
                .branch()
                .ok_or_else(|| TriggerError::Skipped(format!("{} is not a branch", push.git_ref)))?;

            if let Some(configured) = config.spec.source.git_ref()
                && configured != branch
            {
                return Err(TriggerError::Skipped(format!(
                    "push to {} does not match configured ref {}",
                    branch, configured
                )));
            }

            let revision = push.revision();
            (
                Some(branch.to_string()),
                Some(revision.clone()),
                TriggerCause::GitHubWebhook {
                    revision: Some(revision),
                },
            )
        }
        TriggerKind::GenericWebhook => {
            let payload = parse_generic(&event.body)?;
            let git = payload.git.unwrap_or_default();
            let revision = git.revision();
            (
                git.git_ref,
                revision.clone(),
                TriggerCause::GenericWebhook { revision },
            )
        }
        TriggerKind::ImageChange => return Err(TriggerError::NoMatchingTrigger),
    };

    Ok(render(config, git_ref, revision, cause))
}

fn render(
    config: &BuildConfig,
    git_ref: Option<String>,
    revision: Option<SourceRevision>,
    cause: TriggerCause,
) -> BuildSpec {
    let mut spec = BuildSpec::from_template(config, cause);
    if let Some(git_ref) = git_ref {
        spec.source = spec.source.with_ref(git_ref);
    }
    spec.revision = revision;
    spec
}

/// Checks the presented secret against every trigger of `kind`
///
/// All candidates are compared so timing does not reveal which one matched.
fn authenticate(config: &BuildConfig, kind: TriggerKind, presented: &str) -> Result<(), TriggerError> {
    let mut candidates = 0;
    let mut matched = 0u8;

    for secret in config
        .spec
        .triggers
        .iter()
        .filter(|t| t.kind() == Some(kind))
        .filter_map(Trigger::secret)
    {
        candidates += 1;
        if !secret.is_empty() {
            matched |= secret.as_bytes().ct_eq(presented.as_bytes()).unwrap_u8();
        }
    }

    if candidates == 0 {
        return Err(TriggerError::NoMatchingTrigger);
    }
    if matched != 1 {
        return Err(TriggerError::Authentication);
    }
    Ok(())
}

fn parse_github(event: &WebhookEvent) -> Result<GitHubPushEvent, TriggerError> {
    match event.github_event.as_deref() {
        Some(GITHUB_PUSH) => serde_json::from_slice(&event.body)
            .map_err(|e| TriggerError::InvalidPayload(e.to_string())),
        Some(GITHUB_PING) => Err(TriggerError::Skipped("ping".to_string())),
        Some(other) => Err(TriggerError::Skipped(format!("unsupported GitHub event {}", other))),
        None => Err(TriggerError::InvalidPayload(
            "missing X-GitHub-Event header".to_string(),
        )),
    }
}

fn parse_generic(body: &[u8]) -> Result<GenericWebhookPayload, TriggerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(GenericWebhookPayload::default());
    }
    serde_json::from_slice(body).map_err(|e| TriggerError::InvalidPayload(e.to_string()))
}

/// Webhook entry point: evaluates the event and creates the build
pub async fn trigger_webhook(
    store: &Store,
    config_key: &ObjectKey,
    event: &WebhookEvent,
    retries: u32,
) -> Result<String, TriggerError> {
    let config = store
        .get::<BuildConfig>(config_key)
        .await?
        .ok_or_else(|| TriggerError::NotFound(config_key.clone()))?;

    let spec = evaluate_webhook(&config.object, event)?;
    let build = factory::create_build(store, config_key, spec, retries).await?;

    info!(
        "Build {} triggered by {} webhook",
        build.object.metadata.name, event.kind
    );
    Ok(build.object.metadata.name)
}

/// Creates a build by hand from the unchanged template
pub async fn instantiate(
    store: &Store,
    config_key: &ObjectKey,
    message: Option<String>,
    retries: u32,
) -> Result<String, TriggerError> {
    let config = store
        .get::<BuildConfig>(config_key)
        .await?
        .ok_or_else(|| TriggerError::NotFound(config_key.clone()))?;

    let spec = BuildSpec::from_template(&config.object, TriggerCause::Manual { message });
    let build = factory::create_build(store, config_key, spec, retries).await?;
    Ok(build.object.metadata.name)
}

/// A build reserved for an image change, not necessarily created yet
#[derive(Debug, Clone, PartialEq)]
pub struct ImageChangeBuild {
    pub number: u64,
    pub spec: BuildSpec,
}

/// Evaluates an image-change notification against one config
///
/// The notified image and a freshly reserved build number are recorded on the
/// config in one compare-and-swap write; the caller then creates the build
/// under that number. A redelivered notification whose build was never
/// created gets the same number back, so a failure between the two steps
/// loses nothing.
pub async fn evaluate_image_change(
    store: &Store,
    config_key: &ObjectKey,
    notification: &ImageChangeNotification,
    retries: u32,
) -> Result<ImageChangeBuild, TriggerError> {
    ImageReference::parse(&notification.image)
        .map_err(|e| TriggerError::InvalidPayload(e.to_string()))?;

    for attempt in 1..=retries + 1 {
        let current: Versioned<BuildConfig> = store
            .get(config_key)
            .await?
            .ok_or_else(|| TriggerError::NotFound(config_key.clone()))?;

        let mut config = current.object.clone();
        let (last_image, last_build) = config
            .spec
            .triggers
            .iter_mut()
            .find_map(|trigger| match trigger {
                Trigger::ImageChange {
                    from,
                    last_triggered_image,
                    last_triggered_build,
                } if *from == notification.from => Some((last_triggered_image, last_triggered_build)),
                _ => None,
            })
            .ok_or(TriggerError::NoMatchingTrigger)?;

        if last_image.as_deref() == Some(notification.image.as_str()) {
            if let Some(number) = *last_build
                && !build_exists(store, config_key, number).await?
            {
                info!(
                    "Image {} was recorded on {} without its build, resuming build {}",
                    notification.image, config_key, number
                );
                return Ok(ImageChangeBuild {
                    number,
                    spec: image_change_spec(&current.object, notification),
                });
            }
            return Err(TriggerError::StaleNotification(notification.image.clone()));
        }

        let number = config.status.last_version + 1;
        *last_image = Some(notification.image.clone());
        *last_build = Some(number);
        config.status.last_version = number;

        match store.update(&config, current.version).await {
            Ok(_) => {
                return Ok(ImageChangeBuild {
                    number,
                    spec: image_change_spec(&current.object, notification),
                });
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(
                    "Conflict recording image change on {} (attempt {}), re-evaluating",
                    config_key, attempt
                );
            }
            Err(StoreError::NotFound { .. }) => {
                return Err(TriggerError::NotFound(config_key.clone()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(TriggerError::Transient(format!(
        "too many concurrent writers on {}",
        config_key
    )))
}

fn image_change_spec(config: &BuildConfig, notification: &ImageChangeNotification) -> BuildSpec {
    let cause = TriggerCause::ImageChange {
        from: notification.from.clone(),
        image: notification.image.clone(),
    };
    let mut spec = BuildSpec::from_template(config, cause);
    spec.strategy = spec.strategy.with_builder_image(notification.image.clone());
    spec
}

async fn build_exists(store: &Store, config_key: &ObjectKey, number: u64) -> Result<bool, TriggerError> {
    let key = ObjectKey::new(
        config_key.namespace.clone(),
        factory::build_name(&config_key.name, number),
    );
    Ok(store.get::<Build>(&key).await?.is_some())
}

/// Per-config result of an image-change fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageChangeResult {
    pub config: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    pub status: ImageChangeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageChangeStatus {
    Triggered,
    Stale,
    Failed,
}

/// Delivers a notification to every config in the namespace that watches the tag
///
/// Build creation is retried on transient store errors. If it still fails the
/// whole call fails, and delivering the notification again creates the
/// missing builds.
pub async fn notify_image_change(
    store: &Store,
    namespace: &str,
    notification: &ImageChangeNotification,
    retries: u32,
    backoff: Backoff,
) -> Result<Vec<ImageChangeResult>, TriggerError> {
    ImageReference::parse(&notification.image)
        .map_err(|e| TriggerError::InvalidPayload(e.to_string()))?;

    let (configs, _) = store.list::<BuildConfig>(namespace).await?;
    let mut results = Vec::new();
    // Scoped to this call; dropping the call ends any wait
    let cancel = CancellationToken::new();

    for config in configs.iter().filter(|c| watches(&c.object, notification)) {
        let key = config.object.key();
        let outcome = match evaluate_image_change(store, &key, notification, retries).await {
            Ok(reserved) => {
                let key = &key;
                let spec = &reserved.spec;
                with_backoff(
                    backoff,
                    &cancel,
                    "image change build creation",
                    FactoryError::is_transient,
                    move || factory::create_reserved_build(store, key, reserved.number, spec.clone(), retries),
                )
                .await
                .map_err(TriggerError::from)
            }
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok(Some(build)) => {
                info!(
                    "Build {} triggered by image change of {} to {}",
                    build.object.metadata.name, notification.from, notification.image
                );
                ImageChangeResult {
                    config: key.name,
                    build: Some(build.object.metadata.name),
                    status: ImageChangeStatus::Triggered,
                }
            }
            // Another delivery created the build first
            Ok(None) | Err(TriggerError::StaleNotification(_)) => {
                debug!("Image change for {} is stale", key);
                ImageChangeResult {
                    config: key.name,
                    build: None,
                    status: ImageChangeStatus::Stale,
                }
            }
            // Removed or changed between the list and the evaluation
            Err(TriggerError::NotFound(_)) | Err(TriggerError::NoMatchingTrigger) => continue,
            Err(e) if is_transient(&e) => return Err(e),
            Err(e) => {
                warn!("Image change for {} failed: {}", key, e);
                ImageChangeResult {
                    config: key.name,
                    build: None,
                    status: ImageChangeStatus::Failed,
                }
            }
        };
        results.push(result);
    }

    Ok(results)
}

fn watches(config: &BuildConfig, notification: &ImageChangeNotification) -> bool {
    config.spec.triggers.iter().any(|trigger| {
        matches!(trigger, Trigger::ImageChange { from, .. } if *from == notification.from)
    })
}

/// Whether the caller should retry later
pub fn is_transient(err: &TriggerError) -> bool {
    match err {
        TriggerError::Transient(_) => true,
        TriggerError::Store(e) => e.is_transient(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryStore, ObjectKind};
    use crate::testing::{build_config, github_push};
    use kiln_core::domain::build_config::{ImageStreamTag, Secret};
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> Store {
        Store::new(Arc::new(MemoryStore::new()))
    }

    fn memory_store() -> (Arc<MemoryStore>, Store) {
        let memory = Arc::new(MemoryStore::new());
        (memory.clone(), Store::new(memory))
    }

    fn backoff() -> Backoff {
        Backoff::new(3).with_initial(Duration::from_millis(1))
    }

    fn github(secret: &str, body: Vec<u8>) -> WebhookEvent {
        WebhookEvent {
            kind: TriggerKind::GitHubWebhook,
            secret: secret.to_string(),
            github_event: Some("push".to_string()),
            body,
        }
    }

    fn generic(secret: &str, body: &str) -> WebhookEvent {
        WebhookEvent {
            kind: TriggerKind::GenericWebhook,
            secret: secret.to_string(),
            github_event: None,
            body: body.as_bytes().to_vec(),
        }
    }

    fn notification(image: &str) -> ImageChangeNotification {
        ImageChangeNotification {
            from: ImageStreamTag::new("ruby", "2.2"),
            image: image.to_string(),
        }
    }

    #[test]
    fn test_github_webhook_renders_revision() {
        let config = build_config("ci", "app");
        let spec = evaluate_webhook(&config, &github("abc123", github_push("main", "9f2c1e"))).unwrap();

        assert_eq!(spec.strategy, config.spec.strategy);
        assert_eq!(spec.source.git_ref(), Some("main"));
        assert_eq!(spec.revision.as_ref().map(|r| r.commit.as_str()), Some("9f2c1e"));
        assert!(matches!(spec.cause, TriggerCause::GitHubWebhook { .. }));
        assert_eq!(spec.config, Some(config.key()));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let config = build_config("ci", "app");
        let err = evaluate_webhook(&config, &github("wrong", github_push("main", "9f2c1e"))).unwrap_err();
        assert!(matches!(err, TriggerError::Authentication));

        // A secret of another trigger kind does not authenticate either
        let err = evaluate_webhook(&config, &generic("abc123", "")).unwrap_err();
        assert!(matches!(err, TriggerError::Authentication));
    }

    #[test]
    fn test_secret_compare_checks_every_trigger() {
        let mut config = build_config("ci", "app");
        config.spec.triggers.push(Trigger::GitHubWebhook {
            secret: Secret::new("second"),
        });

        assert!(evaluate_webhook(&config, &github("second", github_push("main", "1"))).is_ok());
        assert!(evaluate_webhook(&config, &github("abc123", github_push("main", "1"))).is_ok());
        assert!(evaluate_webhook(&config, &github("abc12", github_push("main", "1"))).is_err());
    }

    #[test]
    fn test_kind_without_trigger() {
        let mut config = build_config("ci", "app");
        config.spec.triggers.retain(|t| t.kind() != Some(TriggerKind::GenericWebhook));
        let err = evaluate_webhook(&config, &generic("generic-secret", "")).unwrap_err();
        assert!(matches!(err, TriggerError::NoMatchingTrigger));
    }

    #[test]
    fn test_github_ping_and_other_branches_are_skipped() {
        let config = build_config("ci", "app");

        let mut ping = github("abc123", b"{}".to_vec());
        ping.github_event = Some("ping".to_string());
        assert!(matches!(
            evaluate_webhook(&config, &ping),
            Err(TriggerError::Skipped(_))
        ));

        let err = evaluate_webhook(&config, &github("abc123", github_push("feature", "1"))).unwrap_err();
        assert!(matches!(err, TriggerError::Skipped(_)));
    }

    #[test]
    fn test_ping_with_wrong_secret_is_rejected() {
        let config = build_config("ci", "app");
        let mut ping = github("wrong", b"{}".to_vec());
        ping.github_event = Some("ping".to_string());
        assert!(matches!(
            evaluate_webhook(&config, &ping),
            Err(TriggerError::Authentication)
        ));
    }

    #[test]
    fn test_github_invalid_payload() {
        let config = build_config("ci", "app");
        let err = evaluate_webhook(&config, &github("abc123", b"not json".to_vec())).unwrap_err();
        assert!(matches!(err, TriggerError::InvalidPayload(_)));
    }

    #[test]
    fn test_generic_webhook_with_and_without_body() {
        let config = build_config("ci", "app");

        let spec = evaluate_webhook(&config, &generic("generic-secret", "")).unwrap();
        assert_eq!(spec.source, config.spec.source);
        assert_eq!(spec.revision, None);

        let spec = evaluate_webhook(
            &config,
            &generic(
                "generic-secret",
                r#"{"git": {"ref": "release", "commit": "c0ffee", "author": "Dev"}}"#,
            ),
        )
        .unwrap();
        assert_eq!(spec.source.git_ref(), Some("release"));
        assert_eq!(spec.revision.unwrap().commit, "c0ffee");
    }

    #[tokio::test]
    async fn test_wrong_secret_does_not_mutate_config() {
        let store = store();
        let config = build_config("ci", "app");
        let created = store.create(&config).await.unwrap();

        let err = trigger_webhook(
            &store,
            &config.key(),
            &github("wrong", github_push("main", "1")),
            3,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TriggerError::Authentication));

        let stored: Versioned<BuildConfig> = store.get_required(&config.key()).await.unwrap();
        assert_eq!(stored.version, created.version);
        let (builds, _) = store.list::<Build>("ci").await.unwrap();
        assert!(builds.is_empty());
    }

    #[tokio::test]
    async fn test_instantiate() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        let name = instantiate(&store, &config.key(), Some("release".to_string()), 3)
            .await
            .unwrap();
        assert_eq!(name, "app-1");

        let build: Versioned<Build> = store
            .get_required(&ObjectKey::new("ci", "app-1"))
            .await
            .unwrap();
        assert_eq!(
            build.object.spec.cause,
            TriggerCause::Manual {
                message: Some("release".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_image_change_then_stale() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        let reserved = evaluate_image_change(&store, &config.key(), &notification("ruby@sha256:abc"), 3)
            .await
            .unwrap();
        assert_eq!(reserved.number, 1);
        assert_eq!(reserved.spec.strategy.builder_image(), "ruby@sha256:abc");

        // Image and number are recorded together
        let stored: Versioned<BuildConfig> = store.get_required(&config.key()).await.unwrap();
        assert_eq!(stored.object.status.last_version, 1);
        assert!(stored.object.spec.triggers.iter().any(|t| matches!(
            t,
            Trigger::ImageChange {
                last_triggered_image: Some(image),
                last_triggered_build: Some(1),
                ..
            } if image == "ruby@sha256:abc"
        )));

        factory::create_reserved_build(&store, &config.key(), reserved.number, reserved.spec, 3)
            .await
            .unwrap();
        let err = evaluate_image_change(&store, &config.key(), &notification("ruby@sha256:abc"), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::StaleNotification(_)));

        // A newer image fires again
        let newer = evaluate_image_change(&store, &config.key(), &notification("ruby@sha256:def"), 3)
            .await
            .unwrap();
        assert_eq!(newer.number, 2);
    }

    #[tokio::test]
    async fn test_redelivery_resumes_uncreated_build() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        let first = evaluate_image_change(&store, &config.key(), &notification("ruby@sha256:abc"), 3)
            .await
            .unwrap();
        // The build was never created; the same notification gets the same number
        let second = evaluate_image_change(&store, &config.key(), &notification("ruby@sha256:abc"), 3)
            .await
            .unwrap();
        assert_eq!(first, second);

        let stored: Versioned<BuildConfig> = store.get_required(&config.key()).await.unwrap();
        assert_eq!(stored.object.status.last_version, 1);
    }

    #[tokio::test]
    async fn test_image_change_for_unwatched_tag() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        let other = ImageChangeNotification {
            from: ImageStreamTag::new("python", "3"),
            image: "python@sha256:abc".to_string(),
        };
        let err = evaluate_image_change(&store, &config.key(), &other, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::NoMatchingTrigger));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_image_changes_build_once() {
        let store = store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        let deliver = || {
            let store = store.clone();
            tokio::spawn(async move {
                notify_image_change(&store, "ci", &notification("ruby@sha256:abc"), 3, backoff()).await
            })
        };
        let (a, b) = (deliver(), deliver());

        let statuses: Vec<ImageChangeStatus> = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()]
            .iter()
            .flatten()
            .map(|r| r.status)
            .collect();
        let triggered = statuses
            .iter()
            .filter(|s| **s == ImageChangeStatus::Triggered)
            .count();
        let stale = statuses
            .iter()
            .filter(|s| **s == ImageChangeStatus::Stale)
            .count();
        assert_eq!((triggered, stale), (1, 1));

        let (builds, _) = store.list::<Build>("ci").await.unwrap();
        assert_eq!(builds.len(), 1);
    }

    #[tokio::test]
    async fn test_notify_fans_out_across_namespace() {
        let store = store();
        store.create(&build_config("ci", "app")).await.unwrap();
        store.create(&build_config("ci", "api")).await.unwrap();
        store.create(&build_config("prod", "app")).await.unwrap();

        let results = notify_image_change(&store, "ci", &notification("ruby@sha256:abc"), 3, backoff())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == ImageChangeStatus::Triggered));

        let again = notify_image_change(&store, "ci", &notification("ruby@sha256:abc"), 3, backoff())
            .await
            .unwrap();
        assert!(again.iter().all(|r| r.status == ImageChangeStatus::Stale));

        let (builds, _) = store.list::<Build>("").await.unwrap();
        assert_eq!(builds.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_build_create_is_retried() {
        let (memory, store) = memory_store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        memory.fail_next_create(ObjectKind::Build);
        let results = notify_image_change(&store, "ci", &notification("ruby@sha256:abc"), 3, backoff())
            .await
            .unwrap();
        assert_eq!(results[0].status, ImageChangeStatus::Triggered);
        assert_eq!(results[0].build.as_deref(), Some("app-1"));

        let (builds, _) = store.list::<Build>("ci").await.unwrap();
        assert_eq!(builds.len(), 1);
    }

    #[tokio::test]
    async fn test_build_lost_to_outage_is_created_on_redelivery() {
        let (memory, store) = memory_store();
        let config = build_config("ci", "app");
        store.create(&config).await.unwrap();

        // Every create attempt of the first delivery fails
        let attempts = backoff().attempts;
        for _ in 0..attempts {
            memory.fail_next_create(ObjectKind::Build);
        }
        let err = notify_image_change(&store, "ci", &notification("ruby@sha256:abc"), 3, backoff())
            .await
            .unwrap_err();
        assert!(is_transient(&err));
        let (builds, _) = store.list::<Build>("ci").await.unwrap();
        assert!(builds.is_empty());

        let results = notify_image_change(&store, "ci", &notification("ruby@sha256:abc"), 3, backoff())
            .await
            .unwrap();
        assert_eq!(results[0].status, ImageChangeStatus::Triggered);
        assert_eq!(results[0].build.as_deref(), Some("app-1"));

        let again = notify_image_change(&store, "ci", &notification("ruby@sha256:abc"), 3, backoff())
            .await
            .unwrap();
        assert_eq!(again[0].status, ImageChangeStatus::Stale);

        let (builds, _) = store.list::<Build>("ci").await.unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(
            builds[0].object.spec.strategy.builder_image(),
            "ruby@sha256:abc"
        );
    }
}
