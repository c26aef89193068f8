//! Build Lifecycle Controller
//!
//! One dispatch loop consumes the Build watch, the intake channel (callbacks
//! and cancellations from the HTTP layer) and a periodic resync, and routes
//! every item to one of N workers by hashing the build key. Items for one
//! build are therefore handled strictly in order while different builds
//! proceed concurrently.
//!
//! Each item runs in its own task; a panic is logged and the worker moves on.
//!
//! If the watch falls behind the store's retained change log, the loop lists
//! all builds again and resumes watching from the list revision.

pub mod lifecycle;
pub mod reconciler;

use kiln_core::domain::build::Build;
use kiln_core::domain::meta::ObjectKey;
use kiln_core::dto::execution::ExecutorCallback;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use lifecycle::LifecycleEvent;
pub use reconciler::{Reconciler, WorkItem};

use crate::repository::{Store, StoreError, StoreResult};
use crate::retry::{Backoff, with_backoff};
use crate::service::Dispatcher;

const INTAKE_DEPTH: usize = 1024;
const WORKER_QUEUE_DEPTH: usize = 256;

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; empty watches all namespaces
    pub namespace: String,
    pub workers: usize,
    pub resync_interval: Duration,
    pub pending_timeout: Duration,
    pub running_timeout: Duration,
    pub conflict_retries: u32,
    pub transient_backoff: Backoff,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller is shutting down")]
    ShuttingDown,
}

/// Sends work to a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    intake: mpsc::Sender<WorkItem>,
}

impl ControllerHandle {
    pub async fn enqueue(&self, item: WorkItem) -> Result<(), ControllerError> {
        self.intake
            .send(item)
            .await
            .map_err(|_| ControllerError::ShuttingDown)
    }

    pub async fn cancel_build(&self, key: ObjectKey) -> Result<(), ControllerError> {
        self.enqueue(WorkItem::Event(key, LifecycleEvent::Cancel)).await
    }

    pub async fn executor_callback(
        &self,
        key: ObjectKey,
        callback: ExecutorCallback,
    ) -> Result<(), ControllerError> {
        self.enqueue(WorkItem::Callback(key, callback)).await
    }
}

pub struct BuildController {
    store: Store,
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
    intake: mpsc::Receiver<WorkItem>,
    cancel: CancellationToken,
}

impl BuildController {
    pub fn new(
        store: Store,
        dispatcher: Arc<Dispatcher>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::channel(INTAKE_DEPTH);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            dispatcher,
            config.clone(),
            cancel.clone(),
        ));

        let controller = Self {
            store,
            reconciler,
            config,
            intake: rx,
            cancel,
        };
        (controller, ControllerHandle { intake: tx })
    }

    /// Runs until the cancellation token fires, then drains the workers
    pub async fn run(mut self) -> StoreResult<()> {
        let workers = self.config.workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            queues.push(tx);
            tasks.push(tokio::spawn(worker(id, rx, self.reconciler.clone())));
        }
        let router = Router { queues };

        info!(
            "Build controller started with {} workers (namespace: {})",
            workers,
            if self.config.namespace.is_empty() { "<all>" } else { self.config.namespace.as_str() }
        );

        // Recover builds left in flight before watching for new changes
        let revision = match self.relist(&router).await {
            Ok(revision) => revision,
            Err(_) if self.cancel.is_cancelled() => {
                return shutdown(router, tasks).await;
            }
            Err(e) => {
                shutdown(router, tasks).await?;
                return Err(e);
            }
        };

        let mut watch = self
            .store
            .watch::<Build>(self.config.namespace.clone(), revision, self.cancel.clone());

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        resync.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(item) = self.intake.recv() => router.route(item).await,

                change = watch.next() => match change {
                    Ok(Some(event)) => {
                        debug!(
                            "Watch: {:?} build {} at {}",
                            event.change,
                            event.object.key(),
                            event.version
                        );
                        router.route(WorkItem::Reconcile(event.object.key())).await;
                    }
                    Ok(None) => break,
                    Err(StoreError::Compacted { after, horizon }) => {
                        warn!(
                            "Build watch at revision {} fell behind the change log (compacted up to {}), relisting",
                            after, horizon
                        );
                        match self.relist(&router).await {
                            Ok(revision) => {
                                watch = self.store.watch::<Build>(
                                    self.config.namespace.clone(),
                                    revision,
                                    self.cancel.clone(),
                                );
                            }
                            Err(_) if self.cancel.is_cancelled() => break,
                            // The old watch fails again and triggers another relist
                            Err(e) => warn!("Relist failed: {}", e),
                        }
                    }
                    Err(e) => {
                        warn!("Build watch failed: {}", e);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.config.transient_backoff.initial) => {}
                        }
                    }
                },

                _ = resync.tick() => self.resync(&router).await,
            }
        }

        shutdown(router, tasks).await
    }

    /// Lists all builds, queues those needing work and returns the list revision
    async fn relist(&self, router: &Router) -> StoreResult<u64> {
        let store = &self.store;
        let namespace = self.config.namespace.as_str();
        let (builds, revision) = with_backoff(
            self.config.transient_backoff,
            &self.cancel,
            "build list",
            StoreError::is_transient,
            move || store.list::<Build>(namespace),
        )
        .await?;

        for build in &builds {
            if self.needs_reconcile(&build.object) {
                router.route(WorkItem::Reconcile(build.object.key())).await;
            }
        }
        Ok(revision)
    }

    async fn resync(&self, router: &Router) {
        let (builds, _) = match self.store.list::<Build>(&self.config.namespace).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Resync failed: {}", e);
                return;
            }
        };

        let mut queued = 0;
        for build in &builds {
            if self.needs_reconcile(&build.object) {
                router.route(WorkItem::Reconcile(build.object.key())).await;
                queued += 1;
            }
        }
        debug!("Resync queued {} build(s)", queued);
    }

    /// Unfinished builds, and finished ones whose execution is still tracked here
    fn needs_reconcile(&self, build: &Build) -> bool {
        !build.status.phase.is_terminal() || self.reconciler.in_flight().get(&build.key()).is_some()
    }
}

/// Routes work to workers by key
struct Router {
    queues: Vec<mpsc::Sender<WorkItem>>,
}

impl Router {
    async fn route(&self, item: WorkItem) {
        let index = shard(item.key(), self.queues.len());
        if self.queues[index].send(item).await.is_err() {
            error!("Worker {} is gone, dropping work item", index);
        }
    }
}

fn shard(key: &ObjectKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn worker(id: usize, mut queue: mpsc::Receiver<WorkItem>, reconciler: Arc<Reconciler>) {
    while let Some(item) = queue.recv().await {
        let key = item.key().clone();
        let reconciler = reconciler.clone();
        let task = tokio::spawn(async move { reconciler.process(item).await });

        if let Err(e) = task.await {
            error!("Work item for build {} panicked: {}", key, e);
        }
    }
    debug!("Worker {} stopped", id);
}

/// Closes the worker queues and waits for queued items to finish
async fn shutdown(router: Router, tasks: Vec<JoinHandle<()>>) -> StoreResult<()> {
    drop(router);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Worker task failed: {}", e);
        }
    }
    info!("Build controller stopped");
    Ok(())
}
