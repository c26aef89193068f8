//! In-memory store backend
//!
//! Used by tests and single-node development. The whole state sits behind one
//! `RwLock`, so every write is atomic and revisions are assigned in order.
//! The change log is a bounded queue; the oldest entries are dropped as new
//! ones arrive.

use async_trait::async_trait;
use kiln_core::domain::meta::ObjectKey;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use super::{
    ChangeType, DEFAULT_CHANGE_RETENTION, ObjectKind, ObjectStore, RawChange, RawList, RawObject,
    StoreError, StoreResult,
};

struct State {
    revision: u64,
    objects: HashMap<(ObjectKind, ObjectKey), RawObject>,
    changes: VecDeque<RawChange>,
    /// Every change up to this revision has been discarded
    compacted: u64,
    retention: usize,
}

impl State {
    fn record(&mut self, kind: ObjectKind, change: ChangeType, object: RawObject) {
        self.changes.push_back(RawChange {
            revision: object.version,
            kind,
            change,
            object,
        });

        while self.changes.len() > self.retention {
            if let Some(dropped) = self.changes.pop_front() {
                self.compacted = dropped.revision;
            }
        }
    }
}

/// Store backend holding everything in process memory
pub struct MemoryStore {
    state: RwLock<State>,
    revision: watch::Sender<u64>,
    /// Number of upcoming calls that fail as unavailable
    failures: AtomicUsize,
    /// Kinds whose next create fails as unavailable, one entry per failure
    failing_creates: Mutex<Vec<ObjectKind>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_CHANGE_RETENTION)
    }

    /// Keeps only the `retention` most recent changes (at least one)
    pub fn with_retention(retention: usize) -> Self {
        let (revision, _) = watch::channel(0);
        let state = State {
            revision: 0,
            objects: HashMap::new(),
            changes: VecDeque::new(),
            compacted: 0,
            retention: retention.max(1),
        };
        Self {
            state: RwLock::new(state),
            revision,
            failures: AtomicUsize::new(0),
            failing_creates: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `count` calls fail with [`StoreError::Unavailable`]
    #[cfg(test)]
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next create of `kind` fail with [`StoreError::Unavailable`]
    #[cfg(test)]
    pub fn fail_next_create(&self, kind: ObjectKind) {
        self.failing_creates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(kind);
    }

    fn check_create(&self, kind: ObjectKind) -> StoreResult<()> {
        self.check_available()?;
        let mut failing = self.failing_creates.lock().unwrap_or_else(|e| e.into_inner());
        match failing.iter().position(|k| *k == kind) {
            Some(index) => {
                failing.remove(index);
                Err(StoreError::Unavailable("injected failure".to_string()))
            }
            None => Ok(()),
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn publish(&self, revision: u64) {
        self.revision.send_replace(revision);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn get(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<Option<RawObject>> {
        self.check_available()?;
        let state = self.read()?;
        Ok(state.objects.get(&(kind, key.clone())).cloned())
    }

    async fn list(&self, kind: ObjectKind, namespace: &str) -> StoreResult<RawList> {
        self.check_available()?;
        let state = self.read()?;
        let mut items: Vec<RawObject> = state
            .objects
            .iter()
            .filter(|((k, key), _)| {
                *k == kind && (namespace.is_empty() || key.namespace == namespace)
            })
            .map(|(_, object)| object.clone())
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(RawList {
            items,
            revision: state.revision,
        })
    }

    async fn create(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        body: serde_json::Value,
    ) -> StoreResult<u64> {
        self.check_create(kind)?;
        let revision = {
            let mut state = self.write()?;
            let slot = (kind, key.clone());
            if state.objects.contains_key(&slot) {
                return Err(StoreError::AlreadyExists {
                    kind,
                    key: key.clone(),
                });
            }

            state.revision += 1;
            let object = RawObject {
                key: key.clone(),
                version: state.revision,
                body,
            };
            state.objects.insert(slot, object.clone());
            state.record(kind, ChangeType::Added, object);
            state.revision
        };

        self.publish(revision);
        Ok(revision)
    }

    async fn update(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        body: serde_json::Value,
        expected_version: u64,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let revision = {
            let mut state = self.write()?;
            let slot = (kind, key.clone());
            let actual = match state.objects.get(&slot) {
                Some(current) => current.version,
                None => {
                    return Err(StoreError::NotFound {
                        kind,
                        key: key.clone(),
                    });
                }
            };
            if actual != expected_version {
                return Err(StoreError::Conflict {
                    kind,
                    key: key.clone(),
                    expected: expected_version,
                    actual,
                });
            }

            state.revision += 1;
            let object = RawObject {
                key: key.clone(),
                version: state.revision,
                body,
            };
            state.objects.insert(slot, object.clone());
            state.record(kind, ChangeType::Modified, object);
            state.revision
        };

        self.publish(revision);
        Ok(revision)
    }

    async fn delete(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<()> {
        self.check_available()?;
        let revision = {
            let mut state = self.write()?;
            let removed = match state.objects.remove(&(kind, key.clone())) {
                Some(object) => object,
                None => {
                    return Err(StoreError::NotFound {
                        kind,
                        key: key.clone(),
                    });
                }
            };

            state.revision += 1;
            let object = RawObject {
                version: state.revision,
                ..removed
            };
            state.record(kind, ChangeType::Deleted, object);
            state.revision
        };

        self.publish(revision);
        Ok(())
    }

    async fn changes(&self, after: u64, limit: usize) -> StoreResult<Vec<RawChange>> {
        self.check_available()?;
        let state = self.read()?;
        if after < state.compacted {
            return Err(StoreError::Compacted {
                after,
                horizon: state.compacted,
            });
        }
        let start = state.changes.partition_point(|c| c.revision <= after);
        Ok(state.changes.range(start..).take(limit).cloned().collect())
    }

    async fn wait_for_change(&self, after: u64, timeout: Duration) {
        let mut rx = self.revision.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|revision| *revision > after)).await;
    }
}
