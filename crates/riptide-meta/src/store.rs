//! The metadata-store contract.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Store-wide modification revision. Zero means "key does not exist" when
/// used as a compare-and-put expectation.
pub type Revision = u64;

/// Identifier of a granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A key-value pair with its modification revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A change notification delivered to a prefix watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
}

/// Errors surfaced by metadata-store operations.
#[derive(Error, Debug)]
pub enum MetaError {
    /// A compare-and-put lost the race; reload and reapply.
    #[error("compare-and-put conflict on {key}")]
    CasConflict { key: String },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("lease not found or expired: {0}")]
    LeaseNotFound(LeaseId),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level store fault; retriable.
    #[error("store error: {0}")]
    Store(String),

    #[error("cancelled")]
    Cancelled,
}

impl MetaError {
    pub fn is_cas_conflict(&self) -> bool {
        matches!(self, MetaError::CasConflict { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, MetaError::Store(_) | MetaError::CasConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;

/// A linearizable KV store with revisions, leases and prefix watches.
///
/// This is the full surface the replication core needs from its metadata
/// store; production deployments adapt their store client to it.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Unconditional write. Returns the new modification revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Revision>;

    /// Write bound to a lease: the key is deleted when the lease expires.
    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<Revision>;

    /// Write only if the key's current modification revision equals
    /// `expected` (zero: the key must not exist). Returns the new revision
    /// or [`MetaError::CasConflict`].
    async fn compare_and_put(
        &self,
        key: &str,
        expected: Revision,
        value: Vec<u8>,
    ) -> Result<Revision>;

    /// Like [`MetaStore::compare_and_put`] but also binds the key to a
    /// lease; used for single-writer locks.
    async fn compare_and_put_with_lease(
        &self,
        key: &str,
        expected: Revision,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> Result<Revision>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Subscribe to changes under a prefix. Events are delivered after the
    /// corresponding write commits; the channel closes when the store shuts
    /// down.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>>;
}
