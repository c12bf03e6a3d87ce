//! Lease heartbeat loop
//!
//! One instance per acquired lock. Renews the backing lease every TTL/3
//! so a missed tick still leaves two renewal attempts before expiry; the
//! worst-case window during which a crashed holder still appears to hold
//! the lock is one TTL period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use volguard_common::LeaseId;
use volguard_store::{LeaseStore, StoreError};

/// State of one heartbeat loop. `Stopped` and `Lost` are terminal; a new
/// acquisition always spawns a new loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// Renewals are running and succeeding
    Active,
    /// The holder released the lock; no further renewals
    Stopped,
    /// The lease lapsed or was removed out from under the holder
    Lost,
}

/// Handle to a running heartbeat loop.
///
/// Dropping the handle without [`Heartbeat::stop`] ends renewal on the
/// next tick and leaves the record to the store's TTL reaper; the task
/// never outlives its handle by more than one renewal period.
#[derive(Debug)]
pub struct Heartbeat {
    state: watch::Receiver<LeaseState>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn a renewal loop for `lease` with the given record TTL.
    pub(crate) fn spawn<S: LeaseStore>(store: Arc<S>, lease: LeaseId, ttl: Duration) -> Self {
        let (state_tx, state_rx) = watch::channel(LeaseState::Active);
        let (stop_tx, stop_rx) = oneshot::channel();
        let period = (ttl / 3).max(Duration::from_millis(100));
        let task = tokio::spawn(run(store, lease, period, state_tx, stop_rx));
        Self {
            state: state_rx,
            stop: Some(stop_tx),
            task,
        }
    }

    /// Current loop state.
    #[must_use]
    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    /// Resolves when the lease is lost. Never resolves for a loop that
    /// ends in `Stopped`.
    pub async fn lost(&self) {
        let mut rx = self.state.clone();
        loop {
            if *rx.borrow_and_update() == LeaseState::Lost {
                return;
            }
            if rx.changed().await.is_err() {
                // Loop ended as Stopped and the sender is gone
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stop renewing and wait for the loop to wind down.
    pub(crate) async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn run<S: LeaseStore>(
    store: Arc<S>,
    lease: LeaseId,
    period: Duration,
    state: watch::Sender<LeaseState>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease was just granted
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!("heartbeat stopped for lease {lease}");
                let _ = state.send(LeaseState::Stopped);
                return;
            }
            _ = ticker.tick() => match store.renew(lease).await {
                Ok(()) => {}
                Err(StoreError::LeaseExpired(_)) => {
                    warn!("lease {lease} lost; stopping work that assumed exclusivity");
                    let _ = state.send(LeaseState::Lost);
                    return;
                }
                // Transient store failure: the TTL/3 cadence leaves two
                // more attempts before the lease can lapse
                Err(e) => warn!("lease {lease} renewal failed: {e}"),
            }
        }
    }
}
