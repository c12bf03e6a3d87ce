//! VolGuard Lease Store - typed client for the external consistent store
//!
//! The locking protocol depends on exactly one primitive for correctness:
//! a linearizable create-if-absent. Everything else here (leases, watches,
//! compare-and-delete) rides on the same store transaction machinery.
//!
//! Two backends implement the [`LeaseStore`] trait:
//!
//! - [`EtcdLeaseStore`] — production backend over etcd v3
//! - [`MemoryLeaseStore`] — single-process backend with the same semantics,
//!   used by tests and local runs

pub mod etcd;
pub mod memory;

pub use etcd::EtcdLeaseStore;
pub use memory::MemoryLeaseStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use volguard_common::LeaseId;

/// Error type for lease store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key (or one of its guard keys) already exists
    #[error("key already exists")]
    AlreadyExists,

    /// The lease has expired or never existed
    #[error("lease {0} expired or not found")]
    LeaseExpired(LeaseId),

    /// Transport or store-side failure; callers must fail closed
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for lease store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// One key/value entry as read from the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key
    pub key: String,
    /// Raw value bytes
    pub value: Vec<u8>,
    /// Lease attached to the key, if any
    pub lease: Option<LeaseId>,
}

/// One change observed by a watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or overwritten
    Put(KeyValue),
    /// A key was deleted or its lease expired
    Delete(String),
}

/// Cancellable, lazily-produced sequence of change events.
///
/// Dropping the stream tears down the underlying store subscription; the
/// backend task notices the closed channel and cancels server-side.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Next change event, or `None` once the subscription has ended
    /// (store disconnect or cancellation).
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Typed wrapper around the external consistent store.
///
/// All operations are atomic with respect to other clients of the same
/// store. Implementations must never report success for an operation whose
/// outcome is unknown.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Create a new lease with the given TTL.
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Atomically create `key` under `lease`, provided `key` and every
    /// `guard` key are all absent. Returns [`StoreError::AlreadyExists`]
    /// when any of them exists; the caller owns revoking the lease then.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
        guards: &[String],
    ) -> StoreResult<()>;

    /// Extend the lease back to its full TTL.
    async fn renew(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke the lease, deleting any keys attached to it. Revoking an
    /// already-expired or unknown lease is not an error.
    async fn revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Durable put without a lease. Used by the metadata layer only; use
    /// records always go through [`Self::create_if_absent`].
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Read one key.
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Read every key under `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Unconditional delete. Returns whether the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete `key` only if it is still attached to `lease`. Returns
    /// whether the delete happened; `false` covers both "key absent" and
    /// "key re-acquired under a different lease".
    async fn delete_if_lease(&self, key: &str, lease: LeaseId) -> StoreResult<bool>;

    /// Subscribe to changes under `prefix`.
    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream>;
}
