//! etcd-backed lease store
//!
//! Maps the [`LeaseStore`] contract onto etcd v3: create-if-absent and
//! compare-and-delete become single transactions with `version == 0` /
//! `lease == id` preconditions, leases use the native grant/keep-alive/
//! revoke machinery, and watches are prefix watches pumped into a local
//! channel so the subscription dies with its consumer.
//!
//! The connection is established once in [`EtcdLeaseStore::connect`];
//! there is no hidden reconnect. A failed request surfaces as
//! [`StoreError::Unavailable`] and the caller decides what to do.

use crate::{KeyValue, LeaseStore, StoreError, StoreResult, WatchEvent, WatchStream};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, SortOrder, SortTarget, Txn,
    TxnOp, WatchOptions, WatchStream as EtcdWatchStream, Watcher,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;
use volguard_common::LeaseId;

/// Lease store backed by an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdLeaseStore {
    client: Client,
}

impl EtcdLeaseStore {
    /// Connect to the given endpoints. Fails fast if no endpoint is
    /// reachable; no background reconnection is attempted afterwards.
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let client = Client::connect(endpoints, None).await.map_err(transport)?;
        Ok(Self { client })
    }
}

fn transport(e: etcd_client::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn is_lease_not_found(e: &etcd_client::Error) -> bool {
    e.to_string().contains("lease not found")
}

fn lease_of(raw: i64) -> Option<LeaseId> {
    (raw != 0).then(|| LeaseId::from(raw))
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        lease: lease_of(kv.lease()),
    }
}

#[async_trait]
impl LeaseStore for EtcdLeaseStore {
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut client = self.client.clone();
        // etcd rejects sub-second TTLs
        let secs = (ttl.as_secs() as i64).max(1);
        let resp = client.lease_grant(secs, None).await.map_err(transport)?;
        Ok(LeaseId::from(resp.id()))
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
        guards: &[String],
    ) -> StoreResult<()> {
        let mut client = self.client.clone();
        let mut compares = Vec::with_capacity(guards.len() + 1);
        compares.push(Compare::version(key, CompareOp::Equal, 0));
        for guard in guards {
            compares.push(Compare::version(guard.as_str(), CompareOp::Equal, 0));
        }
        let txn = Txn::new().when(compares).and_then(vec![TxnOp::put(
            key,
            value.to_vec(),
            Some(PutOptions::new().with_lease(lease.raw())),
        )]);
        let resp = client.txn(txn).await.map_err(|e| {
            if is_lease_not_found(&e) {
                StoreError::LeaseExpired(lease)
            } else {
                transport(e)
            }
        })?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists)
        }
    }

    async fn renew(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease.raw())
            .await
            .map_err(transport)?;
        keeper.keep_alive().await.map_err(transport)?;
        match stream.message().await.map_err(transport)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            // etcd answers a keep-alive for a gone lease with TTL 0
            _ => Err(StoreError::LeaseExpired(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease.raw()).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => Ok(()),
            Err(e) => Err(transport(e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .put(key, value.to_vec(), None)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(transport)?;
        Ok(resp.kvs().first().map(convert_kv))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = client
            .get(prefix, Some(options))
            .await
            .map_err(transport)?;
        Ok(resp.kvs().iter().map(convert_kv).collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await.map_err(transport)?;
        Ok(resp.deleted() > 0)
    }

    async fn delete_if_lease(&self, key: &str, lease: LeaseId) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::lease(key, CompareOp::Equal, lease.raw())])
            .and_then(vec![TxnOp::delete(key, None)]);
        let resp = client.txn(txn).await.map_err(transport)?;
        Ok(resp.succeeded())
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(transport)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(watcher, stream, tx));
        Ok(WatchStream::new(rx))
    }
}

/// Forward etcd watch responses into the consumer channel. Ends (and
/// cancels the server-side watch) as soon as the consumer goes away;
/// a broken stream ends the channel so consumers can fall back to polling.
async fn pump(
    mut watcher: Watcher,
    mut stream: EtcdWatchStream,
    tx: mpsc::UnboundedSender<WatchEvent>,
) {
    loop {
        tokio::select! {
            () = tx.closed() => {
                let _ = watcher.cancel().await;
                return;
            }
            msg = stream.message() => match msg {
                Ok(Some(resp)) => {
                    for event in resp.events() {
                        let Some(kv) = event.kv() else { continue };
                        let out = match event.event_type() {
                            EventType::Put => WatchEvent::Put(convert_kv(kv)),
                            EventType::Delete => {
                                WatchEvent::Delete(String::from_utf8_lossy(kv.key()).into_owned())
                            }
                        };
                        if tx.send(out).is_err() {
                            let _ = watcher.cancel().await;
                            return;
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("watch stream failed: {e}");
                    return;
                }
            }
        }
    }
}
