//! In-memory lease store
//!
//! Single-process implementation of [`LeaseStore`] with the same observable
//! semantics as the etcd backend: linearizable create-if-absent, lease TTLs
//! on the tokio clock, and prefix watches. Expired leases are purged before
//! any operation observes state, so no reader ever sees a lapsed key.

use crate::{KeyValue, LeaseStore, StoreError, StoreResult, WatchEvent, WatchStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use volguard_common::LeaseId;

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    deadline: Instant,
    ttl: Duration,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<i64, Lease>,
    watchers: Vec<Watcher>,
    next_lease: i64,
}

impl Inner {
    /// Drop every lease whose deadline has passed, delete its keys, and
    /// tell watchers. Runs at the top of every operation.
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = self.leases.remove(&id) {
                for key in lease.keys {
                    if self.entries.remove(&key).is_some() {
                        self.notify(WatchEvent::Delete(key));
                    }
                }
            }
        }
    }

    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            let relevant = match &event {
                WatchEvent::Put(kv) => kv.key.starts_with(&w.prefix),
                WatchEvent::Delete(key) => key.starts_with(&w.prefix),
            };
            if relevant {
                w.tx.send(event.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
    }

    fn detach(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(lease) = lease {
            if let Some(meta) = self.leases.get_mut(&lease.raw()) {
                meta.keys.remove(key);
            }
        }
    }
}

/// In-memory [`LeaseStore`] implementation.
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLeaseStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.purge_expired(now);
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                deadline: now + ttl,
                ttl,
                keys: HashSet::new(),
            },
        );
        Ok(LeaseId::from(id))
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
        guards: &[String],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        if inner.entries.contains_key(key) || guards.iter().any(|g| inner.entries.contains_key(g)) {
            return Err(StoreError::AlreadyExists);
        }
        let Some(meta) = inner.leases.get_mut(&lease.raw()) else {
            return Err(StoreError::LeaseExpired(lease));
        };
        meta.keys.insert(key.to_string());
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            lease: Some(lease),
        };
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                lease: Some(lease),
            },
        );
        inner.notify(WatchEvent::Put(kv));
        Ok(())
    }

    async fn renew(&self, lease: LeaseId) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.purge_expired(now);
        match inner.leases.get_mut(&lease.raw()) {
            Some(meta) => {
                meta.deadline = now + meta.ttl;
                Ok(())
            }
            None => Err(StoreError::LeaseExpired(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        if let Some(meta) = inner.leases.remove(&lease.raw()) {
            for key in meta.keys {
                if inner.entries.remove(&key).is_some() {
                    inner.notify(WatchEvent::Delete(key));
                }
            }
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        if let Some(old) = inner.entries.get(key).cloned() {
            inner.detach(key, old.lease);
        }
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            lease: None,
        };
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                lease: None,
            },
        );
        inner.notify(WatchEvent::Put(kv));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        Ok(inner.entries.get(key).map(|entry| KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            lease: entry.lease,
        }))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                lease: entry.lease,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.detach(key, entry.lease);
                inner.notify(WatchEvent::Delete(key.to_string()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_if_lease(&self, key: &str, lease: LeaseId) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        let owned = matches!(inner.entries.get(key), Some(entry) if entry.lease == Some(lease));
        if !owned {
            return Ok(false);
        }
        inner.entries.remove(key);
        inner.detach(key, Some(lease));
        inner.notify(WatchEvent::Delete(key.to_string()));
        Ok(true)
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(10);
        let lease1 = store.grant(ttl).await.unwrap();
        store
            .create_if_absent("k", b"a", lease1, &[])
            .await
            .unwrap();

        let lease2 = store.grant(ttl).await.unwrap();
        let result = store.create_if_absent("k", b"b", lease2, &[]).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists)));

        // The loser's value never landed
        let kv = store.get("k").await.unwrap().unwrap();
        assert_eq!(kv.value, b"a");
        assert_eq!(kv.lease, Some(lease1));
    }

    #[tokio::test]
    async fn test_guard_keys_block_creation() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(10);
        let lease1 = store.grant(ttl).await.unwrap();
        store
            .create_if_absent("vol/mount", b"a", lease1, &[])
            .await
            .unwrap();

        let lease2 = store.grant(ttl).await.unwrap();
        let result = store
            .create_if_absent("vol/snapshot", b"b", lease2, &["vol/mount".to_string()])
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists)));
        assert!(store.get("vol/snapshot").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_removes_key() {
        let store = MemoryLeaseStore::new();
        let lease = store.grant(Duration::from_secs(5)).await.unwrap();
        store.create_if_absent("k", b"v", lease, &[]).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(matches!(
            store.renew(lease).await,
            Err(StoreError::LeaseExpired(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_deadline() {
        let store = MemoryLeaseStore::new();
        let lease = store.grant(Duration::from_secs(5)).await.unwrap();
        store.create_if_absent("k", b"v", lease, &[]).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        store.renew(lease).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_if_lease_matches_only_owner() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(10);
        let lease = store.grant(ttl).await.unwrap();
        store.create_if_absent("k", b"v", lease, &[]).await.unwrap();

        let other = store.grant(ttl).await.unwrap();
        assert!(!store.delete_if_lease("k", other).await.unwrap());
        assert!(store.get("k").await.unwrap().is_some());

        assert!(store.delete_if_lease("k", lease).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.delete_if_lease("k", lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_sees_put_and_delete() {
        let store = MemoryLeaseStore::new();
        let mut watch = store.watch("pfx/").await.unwrap();

        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store
            .create_if_absent("pfx/a", b"v", lease, &[])
            .await
            .unwrap();
        store.put("other/b", b"ignored").await.unwrap();
        store.delete("pfx/a").await.unwrap();

        match watch.next().await.unwrap() {
            WatchEvent::Put(kv) => assert_eq!(kv.key, "pfx/a"),
            other => panic!("expected put, got {other:?}"),
        }
        assert_eq!(
            watch.next().await.unwrap(),
            WatchEvent::Delete("pfx/a".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_sees_lease_expiry_as_delete() {
        let store = MemoryLeaseStore::new();
        let mut watch = store.watch("pfx/").await.unwrap();
        let lease = store.grant(Duration::from_secs(2)).await.unwrap();
        store
            .create_if_absent("pfx/a", b"v", lease, &[])
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        // Purge runs on the next access
        assert!(store.get("pfx/a").await.unwrap().is_none());

        match watch.next().await.unwrap() {
            WatchEvent::Put(_) => {}
            other => panic!("expected put first, got {other:?}"),
        }
        assert_eq!(
            watch.next().await.unwrap(),
            WatchEvent::Delete("pfx/a".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_scoped() {
        let store = MemoryLeaseStore::new();
        store.put("p/b", b"2").await.unwrap();
        store.put("p/a", b"1").await.unwrap();
        store.put("q/c", b"3").await.unwrap();

        let kvs = store.list("p/").await.unwrap();
        let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["p/a", "p/b"]);
    }

    #[tokio::test]
    async fn test_revoke_removes_attached_keys() {
        let store = MemoryLeaseStore::new();
        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store.create_if_absent("k", b"v", lease, &[]).await.unwrap();

        store.revoke(lease).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        // Revoking again is fine
        store.revoke(lease).await.unwrap();
    }
}
