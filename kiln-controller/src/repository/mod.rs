//! Repository Module
//!
//! Data access layer for the controller: a versioned object store holding
//! BuildConfigs and Builds.
//!
//! Every write is stamped with a new resource version drawn from one global,
//! monotonically increasing sequence. Updates must present the version they
//! last observed and are rejected with [`StoreError::Conflict`] otherwise;
//! this compare-and-swap is the only mutual exclusion between controller
//! instances. The change log behind [`ObjectStore::changes`] lets a watcher
//! resume from any retained version without gaps. Only the most recent
//! changes are retained; a watcher that falls further behind gets
//! [`StoreError::Compacted`] and must list again.
//!
//! The backend trait works on JSON bodies so it stays object safe; the typed
//! [`Store`] facade in [`store`] adds (de)serialization per kind.

pub mod memory;
pub mod postgres;
pub mod store;

use async_trait::async_trait;
use kiln_core::domain::meta::ObjectKey;
use std::time::Duration;
use thiserror::Error;

/// Number of most recent changes a backend keeps by default
pub const DEFAULT_CHANGE_RETENTION: usize = 10_000;

// Re-export for convenience
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{Resource, Store, Versioned, WatchEvent, WatchStream};

/// Kinds of objects held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    BuildConfig,
    Build,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::BuildConfig => "BuildConfig",
            ObjectKind::Build => "Build",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BuildConfig" => Ok(ObjectKind::BuildConfig),
            "Build" => Ok(ObjectKind::Build),
            other => Err(StoreError::Invalid(format!("unknown object kind: {}", other))),
        }
    }
}

/// Kind of change recorded in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Added => "Added",
            ChangeType::Modified => "Modified",
            ChangeType::Deleted => "Deleted",
        }
    }
}

impl std::str::FromStr for ChangeType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Added" => Ok(ChangeType::Added),
            "Modified" => Ok(ChangeType::Modified),
            "Deleted" => Ok(ChangeType::Deleted),
            other => Err(StoreError::Invalid(format!("unknown change type: {}", other))),
        }
    }
}

/// A stored object body with its resource version
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    pub key: ObjectKey,
    pub version: u64,
    pub body: serde_json::Value,
}

/// Result of a list: the objects and the store revision they were read at
#[derive(Debug, Clone, Default)]
pub struct RawList {
    pub items: Vec<RawObject>,
    pub revision: u64,
}

/// One entry of the change log
///
/// `revision` equals the resource version the write produced. For deletions
/// the body is the last stored state.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub revision: u64,
    pub kind: ObjectKind,
    pub change: ChangeType,
    pub object: RawObject,
}

/// Store error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: ObjectKind, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ObjectKind, key: ObjectKey },

    #[error("{kind} {key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        kind: ObjectKind,
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("revision {after} is older than the retained change log (compacted up to {horizon})")]
    Compacted { after: u64, horizon: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid stored data: {0}")]
    Invalid(String),

    #[error("failed to encode or decode object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Database(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Backend contract of the versioned object store
///
/// An empty namespace in `list` addresses all namespaces.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Checks that the backend is reachable
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<Option<RawObject>>;

    async fn list(&self, kind: ObjectKind, namespace: &str) -> StoreResult<RawList>;

    /// Creates an object that must not exist yet; returns its version
    async fn create(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        body: serde_json::Value,
    ) -> StoreResult<u64>;

    /// Replaces an object if its version still equals `expected_version`
    async fn update(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        body: serde_json::Value,
        expected_version: u64,
    ) -> StoreResult<u64>;

    async fn delete(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<()>;

    /// Change log entries with a revision greater than `after`, oldest first
    ///
    /// Fails with [`StoreError::Compacted`] if some of them were discarded.
    async fn changes(&self, after: u64, limit: usize) -> StoreResult<Vec<RawChange>>;

    /// Resolves once a revision newer than `after` may exist, or after `timeout`
    async fn wait_for_change(&self, after: u64, timeout: Duration);
}
