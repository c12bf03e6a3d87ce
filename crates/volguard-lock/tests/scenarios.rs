//! End-to-end locking scenarios across multiple simulated hosts sharing
//! one store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use volguard_common::{HolderId, LockClass, VolumeId};
use volguard_lock::{ExecOptions, UseFilter, UseLockManager};
use volguard_store::MemoryLeaseStore;

const TTL: Duration = Duration::from_secs(10);

fn host(store: &Arc<MemoryLeaseStore>, name: &str) -> UseLockManager<MemoryLeaseStore> {
    UseLockManager::new(
        Arc::clone(store),
        "/volguard",
        HolderId::from(format!("{name}:1")),
    )
}

fn vol1() -> VolumeId {
    VolumeId::new("policy1", "vol1").unwrap()
}

#[tokio::test]
async fn scenario_contention_resolves_after_release() {
    let store = Arc::new(MemoryLeaseStore::new());
    let host_a = host(&store, "hostA");
    let host_b = host(&store, "hostB");

    let held = host_a.acquire(&vol1(), LockClass::Mount, TTL).await.unwrap();
    assert!(
        host_b
            .acquire(&vol1(), LockClass::Mount, TTL)
            .await
            .unwrap_err()
            .is_conflict()
    );

    host_a.release(held).await.unwrap();
    let handle = host_b.acquire(&vol1(), LockClass::Mount, TTL).await.unwrap();
    assert_eq!(handle.record().holder.as_str(), "hostB:1");
    host_b.release(handle).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scenario_crashed_holder_expires_within_one_ttl() {
    let store = Arc::new(MemoryLeaseStore::new());
    let host_a = host(&store, "hostA");
    let host_b = host(&store, "hostB");

    let held = host_a.acquire(&vol1(), LockClass::Mount, TTL).await.unwrap();
    // Simulated crash: the handle vanishes without a release, so the
    // heartbeat stops and nothing renews the lease
    drop(held);

    tokio::time::sleep(TTL + Duration::from_secs(1)).await;

    let records = host_b.list(&UseFilter::default()).await.unwrap();
    assert!(records.is_empty());

    let handle = host_b.acquire(&vol1(), LockClass::Mount, TTL).await.unwrap();
    host_b.release(handle).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scenario_force_remove_is_seen_by_the_holder() {
    let store = Arc::new(MemoryLeaseStore::new());
    let host_a = host(&store, "hostA");
    let operator = host(&store, "operator");

    let held = host_a.acquire(&vol1(), LockClass::Mount, TTL).await.unwrap();
    operator
        .force_release(&vol1(), LockClass::Mount)
        .await
        .unwrap();

    // The holder's next renewal discovers the loss
    held.lost().await;
    assert!(host_a.release(held).await.unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn scenario_competing_waiters_serialize() {
    let store = Arc::new(MemoryLeaseStore::new());
    let third_party = host(&store, "hostC");
    let held = third_party
        .acquire(&vol1(), LockClass::Mount, TTL)
        .await
        .unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    for name in ["hostA", "hostB"] {
        let store = Arc::clone(&store);
        let active = Arc::clone(&active);
        let completed = Arc::clone(&completed);
        waiters.push(tokio::spawn(async move {
            let waiter = host(&store, name);
            waiter
                .wait_then_exec(
                    &vol1(),
                    LockClass::Mount,
                    ExecOptions {
                        ttl: TTL,
                        ..Default::default()
                    },
                    std::future::pending(),
                    move || async move {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0, "overlap");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .await
        }));
    }

    // Let both waiters hit the conflict and start watching
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    third_party.release(held).await.unwrap();

    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 2);
    assert!(
        third_party
            .list(&UseFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}
