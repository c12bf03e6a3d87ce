//! Use-lock manager
//!
//! Grants, releases, force-reclaims, and lists exclusive use claims on
//! (policy, volume) pairs. Correctness rests entirely on the store's
//! linearizable create-if-absent: a race between two acquirers is decided
//! by the store, the loser gets [`UseError::Conflict`] and is never
//! silently retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use volguard_common::{HolderId, LockClass, UseError, UseRecord, VolumeId, keys};
use volguard_store::{KeyValue, LeaseStore, StoreError};

use crate::heartbeat::{Heartbeat, LeaseState};

/// A successfully acquired use lock.
///
/// Owns the heartbeat loop renewing the backing lease. Dropping the handle
/// without [`UseLockManager::release`] stops renewal and leaves the record
/// to the store's TTL reaper.
#[derive(Debug)]
pub struct UseHandle {
    record: UseRecord,
    heartbeat: Heartbeat,
}

impl UseHandle {
    /// The acquired record.
    #[must_use]
    pub fn record(&self) -> &UseRecord {
        &self.record
    }

    /// Current lease state.
    #[must_use]
    pub fn state(&self) -> LeaseState {
        self.heartbeat.state()
    }

    /// Resolves when the lease is lost (force-removed or expired).
    pub async fn lost(&self) {
        self.heartbeat.lost().await;
    }
}

/// Filter for [`UseLockManager::list`].
#[derive(Clone, Debug, Default)]
pub struct UseFilter {
    /// Restrict to one volume
    pub volume: Option<VolumeId>,
    /// Restrict to one lock class
    pub class: Option<LockClass>,
}

/// Distributed use-lock manager over a [`LeaseStore`].
pub struct UseLockManager<S> {
    store: Arc<S>,
    prefix: String,
    holder: HolderId,
}

impl<S: LeaseStore> UseLockManager<S> {
    /// Create a manager. The store is an explicit dependency; there is no
    /// process-global client.
    pub fn new(store: Arc<S>, prefix: impl Into<String>, holder: HolderId) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            holder,
        }
    }

    /// The underlying store client.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Namespace prefix this manager operates under.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Try to acquire the `class` lock on `volume` with the given lease
    /// TTL. One transactional create-if-absent, with the opposing class
    /// key as a guard so Mount and Snapshot can never coexist.
    pub async fn acquire(
        &self,
        volume: &VolumeId,
        class: LockClass,
        ttl: Duration,
    ) -> Result<UseHandle, UseError> {
        let key = keys::use_key(&self.prefix, volume, class);
        let guard = keys::use_key(&self.prefix, volume, class.opposing());

        let lease = self.store.grant(ttl).await.map_err(unavailable)?;
        let record = UseRecord {
            volume: volume.clone(),
            class,
            holder: self.holder.clone(),
            acquired_at: Utc::now(),
            lease,
            ttl_secs: ttl.as_secs(),
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| UseError::Unavailable(format!("encode use record: {e}")))?;

        match self
            .store
            .create_if_absent(&key, &value, lease, &[guard])
            .await
        {
            Ok(()) => {
                info!("acquired {class} use on {volume} as {}", self.holder);
                let heartbeat = Heartbeat::spawn(Arc::clone(&self.store), lease, ttl);
                Ok(UseHandle { record, heartbeat })
            }
            Err(StoreError::AlreadyExists) => {
                let _ = self.store.revoke(lease).await;
                Err(UseError::Conflict {
                    volume: volume.clone(),
                    class,
                    holder: self.conflicting_holder(volume, class).await,
                })
            }
            // The fresh lease lapsed before the create landed; the claim
            // never took effect
            Err(StoreError::LeaseExpired(_)) => Err(UseError::LeaseExpired {
                volume: volume.clone(),
                class,
            }),
            Err(e) => {
                let _ = self.store.revoke(lease).await;
                Err(unavailable(e))
            }
        }
    }

    /// Release a held lock. Deletes the record only while it is still
    /// attached to this handle's lease, so a lapsed holder can never
    /// delete a successor's record. Returns [`UseError::NotFound`] when
    /// the record already expired or was force-removed.
    pub async fn release(&self, handle: UseHandle) -> Result<(), UseError> {
        let UseHandle { record, heartbeat } = handle;
        heartbeat.stop().await;

        let key = keys::use_key(&self.prefix, &record.volume, record.class);
        match self.store.delete_if_lease(&key, record.lease).await {
            Ok(true) => {
                let _ = self.store.revoke(record.lease).await;
                info!("released {} use on {}", record.class, record.volume);
                Ok(())
            }
            Ok(false) => Err(UseError::NotFound {
                volume: record.volume,
                class: record.class,
            }),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Unconditionally remove the use record, bypassing the ownership
    /// check. Operator recovery for stuck or dead holders; the original
    /// holder's heartbeat discovers the loss on its next renewal.
    pub async fn force_release(&self, volume: &VolumeId, class: LockClass) -> Result<(), UseError> {
        let key = keys::use_key(&self.prefix, volume, class);
        let existing = self.store.get(&key).await.map_err(unavailable)?;
        match self.store.delete(&key).await {
            Ok(true) => {
                if let Some(lease) = existing.and_then(|kv| kv.lease) {
                    let _ = self.store.revoke(lease).await;
                }
                warn!("force-removed {class} use on {volume}");
                Ok(())
            }
            Ok(false) => Err(UseError::NotFound {
                volume: volume.clone(),
                class,
            }),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Read the current use record for one (volume, class) pair.
    pub async fn get(&self, volume: &VolumeId, class: LockClass) -> Result<UseRecord, UseError> {
        let key = keys::use_key(&self.prefix, volume, class);
        match self.store.get(&key).await.map_err(unavailable)? {
            Some(kv) => decode_record(&kv),
            None => Err(UseError::NotFound {
                volume: volume.clone(),
                class,
            }),
        }
    }

    /// Point-in-time snapshot of use records, ordered by key. The result
    /// can be stale by the time it is displayed.
    pub async fn list(&self, filter: &UseFilter) -> Result<Vec<UseRecord>, UseError> {
        let prefix = match &filter.volume {
            Some(volume) => keys::volume_uses_prefix(&self.prefix, volume),
            None => keys::uses_prefix(&self.prefix),
        };
        let kvs = self.store.list(&prefix).await.map_err(unavailable)?;
        let mut records = Vec::with_capacity(kvs.len());
        for kv in &kvs {
            match decode_record(kv) {
                Ok(record) => {
                    if filter.class.is_none_or(|c| record.class == c) {
                        records.push(record);
                    }
                }
                Err(e) => warn!("skipping undecodable use record: {e}"),
            }
        }
        Ok(records)
    }

    /// Best-effort read of who currently holds a conflicting lock, for
    /// error reporting only.
    async fn conflicting_holder(&self, volume: &VolumeId, class: LockClass) -> String {
        for candidate in [class, class.opposing()] {
            let key = keys::use_key(&self.prefix, volume, candidate);
            if let Ok(Some(kv)) = self.store.get(&key).await {
                if let Ok(record) = decode_record(&kv) {
                    return record.holder.to_string();
                }
            }
        }
        "unknown".to_string()
    }
}

fn decode_record(kv: &KeyValue) -> Result<UseRecord, UseError> {
    serde_json::from_slice(&kv.value).map_err(|e| UseError::Corrupt {
        key: kv.key.clone(),
        reason: e.to_string(),
    })
}

fn unavailable(e: StoreError) -> UseError {
    UseError::Unavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use volguard_store::MemoryLeaseStore;

    const TTL: Duration = Duration::from_secs(10);

    fn manager(store: &Arc<MemoryLeaseStore>, holder: &str) -> UseLockManager<MemoryLeaseStore> {
        UseLockManager::new(
            Arc::clone(store),
            "/volguard",
            HolderId::from(holder.to_string()),
        )
    }

    fn vol(name: &str) -> VolumeId {
        VolumeId::new("policy1", name).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_is_mutually_exclusive() {
        let store = Arc::new(MemoryLeaseStore::new());
        let host_a = manager(&store, "hostA:1");
        let host_b = manager(&store, "hostB:1");
        let volume = vol("db");

        let handle = host_a.acquire(&volume, LockClass::Mount, TTL).await.unwrap();
        let err = host_b
            .acquire(&volume, LockClass::Mount, TTL)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("hostA:1"));

        host_a.release(handle).await.unwrap();
        let handle_b = host_b.acquire(&volume, LockClass::Mount, TTL).await.unwrap();
        assert_eq!(handle_b.record().holder.as_str(), "hostB:1");
        host_b.release(handle_b).await.unwrap();
    }

    #[tokio::test]
    async fn test_cross_class_exclusivity() {
        let store = Arc::new(MemoryLeaseStore::new());
        let host_a = manager(&store, "hostA:1");
        let host_b = manager(&store, "hostB:1");
        let volume = vol("db");

        let handle = host_a.acquire(&volume, LockClass::Mount, TTL).await.unwrap();
        let err = host_b
            .acquire(&volume, LockClass::Snapshot, TTL)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        host_a.release(handle).await.unwrap();

        // And the other way around
        let handle = host_a
            .acquire(&volume, LockClass::Snapshot, TTL)
            .await
            .unwrap();
        assert!(
            host_b
                .acquire(&volume, LockClass::Mount, TTL)
                .await
                .unwrap_err()
                .is_conflict()
        );
        host_a.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_different_volumes_do_not_conflict() {
        let store = Arc::new(MemoryLeaseStore::new());
        let host_a = manager(&store, "hostA:1");
        let host_b = manager(&store, "hostB:1");

        let h1 = host_a
            .acquire(&vol("db1"), LockClass::Mount, TTL)
            .await
            .unwrap();
        let h2 = host_b
            .acquire(&vol("db2"), LockClass::Mount, TTL)
            .await
            .unwrap();
        host_a.release(h1).await.unwrap();
        host_b.release(h2).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_after_force_remove_is_not_found() {
        let store = Arc::new(MemoryLeaseStore::new());
        let host_a = manager(&store, "hostA:1");
        let volume = vol("db");

        let handle = host_a.acquire(&volume, LockClass::Mount, TTL).await.unwrap();
        host_a.force_release(&volume, LockClass::Mount).await.unwrap();

        let err = host_a.release(handle).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_release_never_deletes_a_successor() {
        let store = Arc::new(MemoryLeaseStore::new());
        let host_a = manager(&store, "hostA:1");
        let host_b = manager(&store, "hostB:1");
        let volume = vol("db");

        let stale = host_a.acquire(&volume, LockClass::Mount, TTL).await.unwrap();
        host_a.force_release(&volume, LockClass::Mount).await.unwrap();
        let fresh = host_b.acquire(&volume, LockClass::Mount, TTL).await.unwrap();

        // hostA's release must not touch hostB's record
        assert!(host_a.release(stale).await.unwrap_err().is_not_found());
        let current = host_a.get(&volume, LockClass::Mount).await.unwrap();
        assert_eq!(current.holder.as_str(), "hostB:1");

        host_b.release(fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_release_not_found() {
        let store = Arc::new(MemoryLeaseStore::new());
        let host_a = manager(&store, "hostA:1");
        let err = host_a
            .force_release(&vol("db"), LockClass::Mount)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_volume_and_class() {
        let store = Arc::new(MemoryLeaseStore::new());
        let host_a = manager(&store, "hostA:1");

        let h1 = host_a
            .acquire(&vol("db1"), LockClass::Mount, TTL)
            .await
            .unwrap();
        let h2 = host_a
            .acquire(&vol("db2"), LockClass::Snapshot, TTL)
            .await
            .unwrap();

        let all = host_a.list(&UseFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let mounts = host_a
            .list(&UseFilter {
                class: Some(LockClass::Mount),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].volume, vol("db1"));

        let db2 = host_a
            .list(&UseFilter {
                volume: Some(vol("db2")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(db2.len(), 1);
        assert_eq!(db2[0].class, LockClass::Snapshot);

        host_a.release(h1).await.unwrap();
        host_a.release(h2).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_returns_record() {
        let store = Arc::new(MemoryLeaseStore::new());
        let host_a = manager(&store, "hostA:1");
        let volume = vol("db");

        assert!(
            host_a
                .get(&volume, LockClass::Mount)
                .await
                .unwrap_err()
                .is_not_found()
        );

        let handle = host_a.acquire(&volume, LockClass::Mount, TTL).await.unwrap();
        let record = host_a.get(&volume, LockClass::Mount).await.unwrap();
        assert_eq!(record.holder.as_str(), "hostA:1");
        assert_eq!(record.ttl(), TTL);
        assert_eq!(record.lease, handle.record().lease);
        host_a.release(handle).await.unwrap();
    }
}
