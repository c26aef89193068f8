//! Per-build reconciliation
//!
//! Everything here runs on the worker that owns the build's key, so work for
//! one build is never processed concurrently within an instance.

use chrono::{DateTime, Utc};
use kiln_core::domain::build::{Build, BuildPhase, StatusReason};
use kiln_core::domain::meta::ObjectKey;
use kiln_core::dto::execution::ExecutorCallback;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ControllerConfig;
use super::lifecycle::{ApplyOutcome, LifecycleEvent, apply_event};
use crate::executor::{ExecutorError, InFlight};
use crate::repository::{Store, StoreResult, Versioned};
use crate::retry::with_backoff;
use crate::service::dispatcher::{self, Dispatcher};

/// Unit of work routed to a worker
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Bring the build closer to where it should be
    Reconcile(ObjectKey),
    /// Apply an event, e.g. a cancellation
    Event(ObjectKey, LifecycleEvent),
    /// Relay an executor callback
    Callback(ObjectKey, ExecutorCallback),
}

impl WorkItem {
    pub fn key(&self) -> &ObjectKey {
        match self {
            WorkItem::Reconcile(key) | WorkItem::Event(key, _) | WorkItem::Callback(key, _) => key,
        }
    }
}

pub struct Reconciler {
    store: Store,
    dispatcher: Arc<Dispatcher>,
    in_flight: Arc<InFlight>,
    config: ControllerConfig,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        store: Store,
        dispatcher: Arc<Dispatcher>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            in_flight: Arc::new(InFlight::new()),
            config,
            cancel,
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Processes one work item; failures are logged, never propagated
    pub async fn process(&self, item: WorkItem) {
        let key = item.key().clone();
        let result = match item {
            WorkItem::Reconcile(key) => self.reconcile(&key).await,
            WorkItem::Event(key, event) => self.handle_event(&key, &event).await,
            WorkItem::Callback(key, callback) => self.handle_callback(&key, &callback).await,
        };

        if let Err(e) = result {
            error!("Failed to process build {}: {}", key, e);
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> StoreResult<()> {
        let Some(current) = self.store.get::<Build>(key).await? else {
            if self.in_flight.remove(key).is_some() {
                debug!("Build {} disappeared, forgetting its execution", key);
            }
            return Ok(());
        };

        match current.object.status.phase {
            BuildPhase::New => self.drive_new(current).await,
            BuildPhase::Pending | BuildPhase::Running => {
                if self.timed_out(&current.object, Utc::now()) {
                    warn!(
                        "Build {} timed out in phase {}",
                        key, current.object.status.phase
                    );
                    self.handle_event(key, &LifecycleEvent::TimedOut).await
                } else {
                    Ok(())
                }
            }
            BuildPhase::Complete | BuildPhase::Failed | BuildPhase::Error | BuildPhase::Cancelled => {
                // Finished by another writer; abort only what this instance started
                if let Some(handle) = self.in_flight.remove(key) {
                    self.abort_if_ended_early(&current.object, &handle).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_event(&self, key: &ObjectKey, event: &LifecycleEvent) -> StoreResult<()> {
        match apply_event(&self.store, key, event, self.config.conflict_retries).await? {
            ApplyOutcome::Applied(build) if build.object.status.phase.is_terminal() => {
                self.release(&build.object).await;
            }
            ApplyOutcome::Applied(_) | ApplyOutcome::Ignored(_) => {}
            ApplyOutcome::NotFound => debug!("Build {} not found for {:?}", key, event),
        }
        Ok(())
    }

    async fn handle_callback(&self, key: &ObjectKey, callback: &ExecutorCallback) -> StoreResult<()> {
        let Some(current) = self.store.get::<Build>(key).await? else {
            debug!("Callback for unknown build {}", key);
            return Ok(());
        };

        let status = &current.object.status;
        if status.phase.is_terminal() {
            debug!("Late callback for finished build {}", key);
            return Ok(());
        }

        let expected = match status.execution.clone().or_else(|| self.in_flight.get(key)) {
            Some(handle) => Some(handle),
            // Started elsewhere, or the starter died before recording the handle
            None if status.phase == BuildPhase::Pending => self.adopt(key, &callback.handle).await?,
            None => None,
        };
        if expected.as_deref() != Some(callback.handle.as_str()) {
            warn!(
                "Ignoring callback for build {} from unknown execution {}",
                key, callback.handle
            );
            return Ok(());
        }

        self.handle_event(key, &dispatcher::translate(&callback.event))
            .await
    }

    /// Records `handle` as the execution of a Pending build that has none yet
    ///
    /// Returns the handle the build ends up with; the first one recorded wins.
    async fn adopt(&self, key: &ObjectKey, handle: &str) -> StoreResult<Option<String>> {
        let outcome = apply_event(
            &self.store,
            key,
            &LifecycleEvent::Dispatched(handle.to_string()),
            self.config.conflict_retries,
        )
        .await?;

        Ok(match outcome {
            ApplyOutcome::Applied(build) => {
                info!("Build {} adopted execution {} from a callback", key, handle);
                build.object.status.execution
            }
            ApplyOutcome::Ignored(build) => build.object.status.execution,
            ApplyOutcome::NotFound => None,
        })
    }

    /// Prepares a new build, moves it to Pending and starts it
    ///
    /// Only the instance whose Pending write wins calls the executor.
    async fn drive_new(&self, current: Versioned<Build>) -> StoreResult<()> {
        let key = current.object.key();

        let request = match self.dispatcher.prepare(&current.object) {
            Ok(request) => request,
            Err(e) => {
                warn!("Build {} cannot be prepared: {}", key, e);
                return self
                    .handle_event(&key, &LifecycleEvent::PrepareFailed(e.to_string()))
                    .await;
            }
        };

        match apply_event(
            &self.store,
            &key,
            &LifecycleEvent::Prepared,
            self.config.conflict_retries,
        )
        .await?
        {
            ApplyOutcome::Applied(_) => {}
            ApplyOutcome::Ignored(_) | ApplyOutcome::NotFound => {
                debug!("Build {} was already taken over", key);
                return Ok(());
            }
        }

        let dispatcher = &self.dispatcher;
        let request = &request;
        let started = with_backoff(
            self.config.transient_backoff,
            &self.cancel,
            "start execution",
            ExecutorError::is_transient,
            move || dispatcher.start(request),
        )
        .await;

        let handle = match started {
            Ok(handle) => handle,
            Err(_) if self.cancel.is_cancelled() => {
                // Left Pending; the pending timeout settles it
                return Ok(());
            }
            Err(e) => {
                error!("Failed to start build {}: {}", key, e);
                return self
                    .handle_event(&key, &LifecycleEvent::StartFailed(e.to_string()))
                    .await;
            }
        };

        info!("Build {} dispatched as execution {}", key, handle);
        self.in_flight.insert(key.clone(), handle.clone());

        match apply_event(
            &self.store,
            &key,
            &LifecycleEvent::Dispatched(handle),
            self.config.conflict_retries,
        )
        .await?
        {
            ApplyOutcome::Ignored(build) if build.object.status.phase.is_terminal() => {
                self.release(&build.object).await;
            }
            _ => {}
        }
        Ok(())
    }

    fn timed_out(&self, build: &Build, now: DateTime<Utc>) -> bool {
        let policy = &build.spec.run_policy;
        let (since, limit) = match build.status.phase {
            BuildPhase::Pending => (
                build.status.last_transition,
                policy
                    .pending_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.pending_timeout),
            ),
            BuildPhase::Running => (
                build.status.start_timestamp.unwrap_or(build.status.last_transition),
                policy
                    .running_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.running_timeout),
            ),
            _ => return false,
        };

        match (now - since).to_std() {
            Ok(elapsed) => elapsed > limit,
            // `since` lies in the future
            Err(_) => false,
        }
    }

    /// Forgets a finished build's execution, aborting it if the build ended early
    ///
    /// The persisted handle covers executions started by an earlier process or
    /// by another instance.
    async fn release(&self, build: &Build) {
        let key = build.key();
        let Some(handle) = self
            .in_flight
            .remove(&key)
            .or_else(|| build.status.execution.clone())
        else {
            return;
        };
        self.abort_if_ended_early(build, &handle).await;
    }

    async fn abort_if_ended_early(&self, build: &Build, handle: &str) {
        let key = build.key();
        let aborted = matches!(
            build.status.reason,
            Some(StatusReason::CancelledBuild)
                | Some(StatusReason::PendingTimeout)
                | Some(StatusReason::RunningTimeout)
        );
        if !aborted {
            return;
        }

        match self.dispatcher.cancel(handle).await {
            Ok(()) => info!("Aborted execution {} of build {}", handle, key),
            Err(e) => warn!(
                "Failed to abort execution {} of build {}: {}",
                handle, key, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::testing::{FakeExecutor, controller_config, new_build};
    use chrono::Duration as ChronoDuration;
    use kiln_core::domain::strategy::Output;
    use kiln_core::dto::execution::ExecutorEvent;

    struct Fixture {
        store: Store,
        executor: Arc<FakeExecutor>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let executor = Arc::new(FakeExecutor::new());
        let dispatcher = Arc::new(Dispatcher::new(executor.clone(), "docker.io"));
        let reconciler = Reconciler::new(
            store.clone(),
            dispatcher,
            controller_config(),
            CancellationToken::new(),
        );
        Fixture {
            store,
            executor,
            reconciler,
        }
    }

    async fn phase(store: &Store, key: &ObjectKey) -> Build {
        store.get_required::<Build>(key).await.unwrap().object
    }

    fn callback(handle: &str, event: ExecutorEvent) -> WorkItem {
        WorkItem::Callback(
            ObjectKey::new("ci", "app-1"),
            ExecutorCallback {
                handle: handle.to_string(),
                event,
            },
        )
    }

    #[tokio::test]
    async fn test_new_build_is_dispatched() {
        let f = fixture();
        let build = new_build("ci", "app-1");
        f.store.create(&build).await.unwrap();

        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.phase, BuildPhase::Pending);
        assert_eq!(stored.status.execution.as_deref(), Some("exec-1"));
        assert_eq!(f.executor.started().len(), 1);
        assert_eq!(f.reconciler.in_flight().get(&build.key()).as_deref(), Some("exec-1"));

        // Reconciling again does not start a second execution
        f.reconciler.process(WorkItem::Reconcile(build.key())).await;
        assert_eq!(f.executor.started().len(), 1);
    }

    #[tokio::test]
    async fn test_callbacks_drive_to_complete() {
        let f = fixture();
        let build = new_build("ci", "app-1");
        f.store.create(&build).await.unwrap();
        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        f.reconciler.process(callback("exec-1", ExecutorEvent::Started)).await;
        assert_eq!(phase(&f.store, &build.key()).await.status.phase, BuildPhase::Running);

        f.reconciler
            .process(callback("exec-1", ExecutorEvent::Completed { exit_code: 0 }))
            .await;
        let done = phase(&f.store, &build.key()).await;
        assert_eq!(done.status.phase, BuildPhase::Complete);
        assert!(done.status.start_timestamp.is_some());
        assert!(done.status.completion_timestamp.is_some());

        // Completed builds are released without an abort
        assert!(f.reconciler.in_flight().is_empty());
        assert!(f.executor.cancelled().is_empty());

        // Late callbacks change nothing
        f.reconciler
            .process(callback("exec-1", ExecutorEvent::Completed { exit_code: 1 }))
            .await;
        assert_eq!(phase(&f.store, &build.key()).await.status.phase, BuildPhase::Complete);
    }

    #[tokio::test]
    async fn test_callback_from_unknown_execution_is_ignored() {
        let f = fixture();
        let build = new_build("ci", "app-1");
        f.store.create(&build).await.unwrap();
        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        f.reconciler.process(callback("exec-99", ExecutorEvent::Started)).await;
        assert_eq!(phase(&f.store, &build.key()).await.status.phase, BuildPhase::Pending);
    }

    #[tokio::test]
    async fn test_prepare_failure_is_error() {
        let f = fixture();
        let mut build = new_build("ci", "app-1");
        build.spec.output = Output::default();
        f.store.create(&build).await.unwrap();

        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.phase, BuildPhase::Error);
        assert_eq!(stored.status.reason, Some(StatusReason::PrepareFailed));
        assert!(stored.status.completion_timestamp.is_some());
        assert!(f.executor.started().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_is_error() {
        let f = fixture();
        f.executor.fail_starts(true);
        let build = new_build("ci", "app-1");
        f.store.create(&build).await.unwrap();

        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.phase, BuildPhase::Error);
        assert_eq!(stored.status.reason, Some(StatusReason::StartFailed));
    }

    #[tokio::test]
    async fn test_cancel_aborts_execution() {
        let f = fixture();
        let build = new_build("ci", "app-1");
        f.store.create(&build).await.unwrap();
        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        f.reconciler
            .process(WorkItem::Event(build.key(), LifecycleEvent::Cancel))
            .await;

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.phase, BuildPhase::Cancelled);
        assert_eq!(f.executor.cancelled(), vec!["exec-1".to_string()]);
        assert!(f.reconciler.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_restart_aborts_recorded_execution() {
        let f = fixture();
        let mut build = new_build("ci", "app-1");
        build.status.phase = BuildPhase::Running;
        build.status.start_timestamp = Some(Utc::now());
        build.status.execution = Some("exec-7".to_string());
        f.store.create(&build).await.unwrap();

        // Nothing in this instance's memory; the stored handle is used
        assert!(f.reconciler.in_flight().is_empty());
        f.reconciler
            .process(WorkItem::Event(build.key(), LifecycleEvent::Cancel))
            .await;

        assert_eq!(phase(&f.store, &build.key()).await.status.phase, BuildPhase::Cancelled);
        assert_eq!(f.executor.cancelled(), vec!["exec-7".to_string()]);

        // Seeing the finished build again does not abort twice
        f.reconciler.process(WorkItem::Reconcile(build.key())).await;
        assert_eq!(f.executor.cancelled().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_after_restart_aborts_recorded_execution() {
        let f = fixture();
        let mut build = new_build("ci", "app-1");
        build.status.phase = BuildPhase::Pending;
        build.status.last_transition = Utc::now() - ChronoDuration::seconds(3600);
        build.status.execution = Some("exec-3".to_string());
        f.store.create(&build).await.unwrap();

        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.reason, Some(StatusReason::PendingTimeout));
        assert_eq!(f.executor.cancelled(), vec!["exec-3".to_string()]);
    }

    #[tokio::test]
    async fn test_callback_before_handle_is_recorded() {
        let f = fixture();
        // Pending without a handle: the instance that started it has not
        // recorded the dispatch yet, or died before it could
        let mut build = new_build("ci", "app-1");
        build.status.phase = BuildPhase::Pending;
        f.store.create(&build).await.unwrap();

        f.reconciler.process(callback("exec-5", ExecutorEvent::Started)).await;

        let running = phase(&f.store, &build.key()).await;
        assert_eq!(running.status.phase, BuildPhase::Running);
        assert_eq!(running.status.execution.as_deref(), Some("exec-5"));

        // The adopted handle is now the only one accepted
        f.reconciler
            .process(callback("exec-6", ExecutorEvent::Completed { exit_code: 1 }))
            .await;
        assert_eq!(phase(&f.store, &build.key()).await.status.phase, BuildPhase::Running);

        f.reconciler
            .process(callback("exec-5", ExecutorEvent::Completed { exit_code: 0 }))
            .await;
        assert_eq!(phase(&f.store, &build.key()).await.status.phase, BuildPhase::Complete);
    }

    #[tokio::test]
    async fn test_late_dispatch_keeps_adopted_handle() {
        let f = fixture();
        let build = new_build("ci", "app-1");
        f.store.create(&build).await.unwrap();
        apply_event(&f.store, &build.key(), &LifecycleEvent::Prepared, 3)
            .await
            .unwrap();

        f.reconciler.process(callback("exec-1", ExecutorEvent::Started)).await;

        // The starter's own write arrives afterwards and changes nothing
        let outcome = apply_event(
            &f.store,
            &build.key(),
            &LifecycleEvent::Dispatched("exec-1".to_string()),
            3,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Ignored(_)));

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.phase, BuildPhase::Running);
        assert_eq!(stored.status.execution.as_deref(), Some("exec-1"));
    }

    #[tokio::test]
    async fn test_callback_for_new_build_is_ignored() {
        let f = fixture();
        let build = new_build("ci", "app-1");
        f.store.create(&build).await.unwrap();

        f.reconciler.process(callback("exec-1", ExecutorEvent::Started)).await;

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.phase, BuildPhase::New);
        assert!(stored.status.execution.is_none());
    }

    #[tokio::test]
    async fn test_pending_timeout() {
        let f = fixture();
        let mut build = new_build("ci", "app-1");
        build.status.phase = BuildPhase::Pending;
        build.status.last_transition = Utc::now() - ChronoDuration::seconds(3600);
        f.store.create(&build).await.unwrap();

        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.phase, BuildPhase::Error);
        assert_eq!(stored.status.reason, Some(StatusReason::PendingTimeout));
    }

    #[tokio::test]
    async fn test_running_timeout_from_run_policy() {
        let f = fixture();
        let mut build = new_build("ci", "app-1");
        build.spec.run_policy.running_timeout_secs = Some(5);
        build.status.phase = BuildPhase::Running;
        build.status.start_timestamp = Some(Utc::now() - ChronoDuration::seconds(10));
        f.store.create(&build).await.unwrap();

        assert!(f.reconciler.timed_out(&build, Utc::now()));
        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        let stored = phase(&f.store, &build.key()).await;
        assert_eq!(stored.status.phase, BuildPhase::Error);
        assert_eq!(stored.status.reason, Some(StatusReason::RunningTimeout));
        assert_eq!(stored.status.duration_secs.map(|d| d >= 10), Some(true));
    }

    #[tokio::test]
    async fn test_running_build_within_limits_is_left_alone() {
        let f = fixture();
        let mut build = new_build("ci", "app-1");
        build.status.phase = BuildPhase::Running;
        build.status.start_timestamp = Some(Utc::now());
        let created = f.store.create(&build).await.unwrap();

        f.reconciler.process(WorkItem::Reconcile(build.key())).await;

        let stored = f.store.get_required::<Build>(&build.key()).await.unwrap();
        assert_eq!(stored.version, created.version);
    }
}
