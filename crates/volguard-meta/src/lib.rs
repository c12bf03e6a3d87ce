//! VolGuard Meta - policy and volume metadata
//!
//! Plain key-value CRUD over the same consistent store the lock manager
//! uses. Policies carry the lock-timeout defaults the lock layer consumes;
//! volumes are existence-checked before locks are taken out on them.
//! Nothing here talks to the block-storage backend itself.

pub mod policy;
pub mod volume;

pub use policy::Policy;
pub use volume::VolumeMeta;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use volguard_common::VolumeId;
use volguard_store::{LeaseStore, StoreError};

/// Error type for metadata operations
#[derive(Debug, Error)]
pub enum MetaError {
    /// No such policy
    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    /// No such archived policy revision
    #[error("policy revision not found: {0} rev {1}")]
    RevisionNotFound(String, u64),

    /// No such volume
    #[error("volume not found: {0}")]
    VolumeNotFound(VolumeId),

    /// Volume already exists
    #[error("volume already exists: {0}")]
    VolumeExists(VolumeId),

    /// Volume has live use locks and `force` was not given
    #[error("volume is in use: {0}")]
    VolumeInUse(VolumeId),

    /// A document failed to encode or decode
    #[error("invalid document: {0}")]
    Invalid(String),

    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for MetaError {
    fn from(e: StoreError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(e.to_string())
    }
}

/// Result type for metadata operations
pub type MetaResult<T> = Result<T, MetaError>;

/// Typed metadata client over a [`LeaseStore`].
pub struct MetadataClient<S> {
    store: Arc<S>,
    prefix: String,
    default_ttl: Duration,
}

impl<S: LeaseStore> MetadataClient<S> {
    /// Create a client. `default_ttl` is the lock TTL applied when a
    /// policy does not set its own.
    pub fn new(store: Arc<S>, prefix: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            default_ttl,
        }
    }
}
