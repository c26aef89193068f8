//! Typed store facade
//!
//! Wraps an [`ObjectStore`] backend and (de)serializes the domain types,
//! pairing every object with the resource version it was read at.

use kiln_core::domain::build::Build;
use kiln_core::domain::build_config::BuildConfig;
use kiln_core::domain::meta::ObjectKey;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ChangeType, ObjectKind, ObjectStore, RawObject, StoreError, StoreResult};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const WATCH_BATCH: usize = 256;

/// A kind of object the store can hold
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ObjectKind;

    fn key(&self) -> ObjectKey;
}

impl Resource for BuildConfig {
    const KIND: ObjectKind = ObjectKind::BuildConfig;

    fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

impl Resource for Build {
    const KIND: ObjectKind = ObjectKind::Build;

    fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

/// An object together with the version it was read or written at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub object: T,
    pub version: u64,
}

/// One change observed through a watch
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent<T> {
    pub change: ChangeType,
    pub object: T,
    pub version: u64,
}

/// Typed access to the versioned object store
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn ObjectStore>,
    poll_interval: Duration,
}

impl Store {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets how long a watch waits between change-log polls when idle
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.backend.ping().await
    }

    pub async fn get<T: Resource>(&self, key: &ObjectKey) -> StoreResult<Option<Versioned<T>>> {
        self.backend
            .get(T::KIND, key)
            .await?
            .map(decode)
            .transpose()
    }

    /// Like [`Store::get`], but a missing object is a [`StoreError::NotFound`]
    pub async fn get_required<T: Resource>(&self, key: &ObjectKey) -> StoreResult<Versioned<T>> {
        self.get(key).await?.ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            key: key.clone(),
        })
    }

    /// Lists objects of one kind; an empty namespace lists all namespaces
    ///
    /// Also returns the store revision the list was read at, from which a
    /// watch can continue without missing changes.
    pub async fn list<T: Resource>(&self, namespace: &str) -> StoreResult<(Vec<Versioned<T>>, u64)> {
        let list = self.backend.list(T::KIND, namespace).await?;
        let items = list
            .items
            .into_iter()
            .map(decode)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok((items, list.revision))
    }

    pub async fn create<T: Resource>(&self, object: &T) -> StoreResult<Versioned<T>> {
        let body = serde_json::to_value(object)?;
        let version = self.backend.create(T::KIND, &object.key(), body).await?;
        Ok(Versioned {
            object: object.clone(),
            version,
        })
    }

    /// Writes `object` if the stored version is still `expected_version`
    pub async fn update<T: Resource>(&self, object: &T, expected_version: u64) -> StoreResult<u64> {
        let body = serde_json::to_value(object)?;
        self.backend
            .update(T::KIND, &object.key(), body, expected_version)
            .await
    }

    pub async fn delete<T: Resource>(&self, key: &ObjectKey) -> StoreResult<()> {
        self.backend.delete(T::KIND, key).await
    }

    /// Watches one kind for changes newer than revision `from`
    pub fn watch<T: Resource>(
        &self,
        namespace: impl Into<String>,
        from: u64,
        cancel: CancellationToken,
    ) -> WatchStream<T> {
        WatchStream {
            backend: self.backend.clone(),
            namespace: namespace.into(),
            cursor: from,
            poll_interval: self.poll_interval,
            cancel,
            buffer: VecDeque::new(),
            _kind: PhantomData,
        }
    }
}

fn decode<T: Resource>(raw: RawObject) -> StoreResult<Versioned<T>> {
    Ok(Versioned {
        object: serde_json::from_value(raw.body)?,
        version: raw.version,
    })
}

/// Pull-based watch over the store's change log
///
/// Delivery is at-least-once: after a restart from an older revision, changes
/// may be seen again. A watch that falls behind the retained change log
/// fails with [`StoreError::Compacted`]; the caller lists again and starts a
/// new watch from the list revision.
pub struct WatchStream<T> {
    backend: Arc<dyn ObjectStore>,
    namespace: String,
    cursor: u64,
    poll_interval: Duration,
    cancel: CancellationToken,
    buffer: VecDeque<WatchEvent<T>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> WatchStream<T> {
    /// Revision of the last change consumed from the log
    pub fn revision(&self) -> u64 {
        self.cursor
    }

    /// Waits for the next change
    ///
    /// Returns `Ok(None)` once the cancellation token fires. Cancel safe: if
    /// the future is dropped before completing, no change is lost.
    pub async fn next(&mut self) -> StoreResult<Option<WatchEvent<T>>> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(Some(event));
            }

            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let changes = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                result = self.backend.changes(self.cursor, WATCH_BATCH) => result?,
            };

            if changes.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    _ = self.backend.wait_for_change(self.cursor, self.poll_interval) => {}
                }
                continue;
            }

            for change in changes {
                self.cursor = self.cursor.max(change.revision);

                if change.kind != T::KIND {
                    continue;
                }
                if !self.namespace.is_empty() && change.object.key.namespace != self.namespace {
                    continue;
                }

                let key = change.object.key.clone();
                match serde_json::from_value::<T>(change.object.body) {
                    Ok(object) => self.buffer.push_back(WatchEvent {
                        change: change.change,
                        object,
                        version: change.object.version,
                    }),
                    Err(e) => warn!(
                        "Skipping undecodable {} {} at revision {}: {}",
                        T::KIND,
                        key,
                        change.revision,
                        e
                    ),
                }
            }
        }
    }
}
