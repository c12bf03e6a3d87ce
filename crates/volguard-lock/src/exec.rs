//! Wait-and-execute coordinator
//!
//! Blocks until a target lock frees, races to acquire it, runs a
//! caller-supplied action under the lock, and releases on every exit
//! path. The watch on the volume's use prefix is only a wake-up hint:
//! after the same delete event any number of waiters may race, and the
//! store's atomic create-if-absent is the sole arbiter of who wins.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use volguard_common::{LockClass, UseError, VolumeId, keys};
use volguard_store::{LeaseStore, WatchStream};

use crate::manager::{UseHandle, UseLockManager};

/// Options for [`UseLockManager::wait_then_exec`].
#[derive(Clone, Debug)]
pub struct ExecOptions {
    /// Lease TTL for the acquired lock
    pub ttl: Duration,
    /// Give up waiting after this long; `None` waits indefinitely
    pub wait_timeout: Option<Duration>,
    /// Polling fallback cadence while the watch is unavailable, and the
    /// upper bound on how stale a missed wake-up can leave us
    pub poll_interval: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            wait_timeout: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Error type for wait-and-execute calls
#[derive(Debug, Error)]
pub enum ExecError {
    /// The wait timeout elapsed before the lock could be acquired
    #[error("timed out waiting for use lock")]
    WaitTimeout,

    /// The caller's cancellation signal fired while waiting
    #[error("cancelled while waiting for use lock")]
    Cancelled,

    /// The lease was lost while the action was running; the action was
    /// aborted because exclusivity could no longer be assumed
    #[error("use lease lost while the action was running")]
    LeaseLost,

    /// The action panicked
    #[error("action panicked or was aborted")]
    ActionAborted,

    /// Lock-manager failure (store unavailable, corrupt record, ...)
    #[error(transparent)]
    Lock(#[from] UseError),
}

enum Wake {
    Retry,
    WatchClosed,
    Timeout,
    Cancelled,
}

impl<S: LeaseStore> UseLockManager<S> {
    /// Wait until the `class` lock on `volume` can be acquired, run
    /// `action` under it, and release it afterwards regardless of the
    /// action's outcome.
    ///
    /// `cancel` aborts the wait with [`ExecError::Cancelled`] and no store
    /// mutation. Once the action is running, cancellation no longer
    /// applies: the action defines its own interruptibility and release is
    /// guaranteed either way. A lease lost mid-action aborts the action
    /// and surfaces as [`ExecError::LeaseLost`].
    pub async fn wait_then_exec<F, Fut, T>(
        &self,
        volume: &VolumeId,
        class: LockClass,
        options: ExecOptions,
        cancel: impl Future<Output = ()> + Send,
        action: F,
    ) -> Result<T, ExecError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::pin!(cancel);
        let deadline = options.wait_timeout.map(|t| Instant::now() + t);
        let handle = self
            .wait_for_lock(volume, class, &options, deadline, cancel.as_mut())
            .await?;

        // Spawned so a panic inside the action becomes a join error
        // instead of unwinding past the release below.
        let mut task = tokio::spawn(action());
        let abort = task.abort_handle();
        let outcome = tokio::select! {
            result = &mut task => result.map_err(|_| ExecError::ActionAborted),
            () = handle.lost() => {
                abort.abort();
                Err(ExecError::LeaseLost)
            }
        };

        match self.release(handle).await {
            Ok(()) => {}
            // Already expired or force-removed; nothing left to release
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("release after exec failed: {e}"),
        }
        outcome
    }

    async fn wait_for_lock<F: Future<Output = ()>>(
        &self,
        volume: &VolumeId,
        class: LockClass,
        options: &ExecOptions,
        deadline: Option<Instant>,
        mut cancel: Pin<&mut F>,
    ) -> Result<UseHandle, ExecError> {
        let mut watch: Option<WatchStream> = None;
        loop {
            match self.acquire(volume, class, options.ttl).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(ExecError::Lock(e)),
            }

            if watch.is_none() {
                let prefix = keys::volume_uses_prefix(self.prefix(), volume);
                match self.store().watch(&prefix).await {
                    Ok(stream) => watch = Some(stream),
                    Err(e) => debug!("watch unavailable, polling instead: {e}"),
                }
            }

            match wake(
                watch.as_mut(),
                deadline,
                options.poll_interval,
                cancel.as_mut(),
            )
            .await
            {
                Wake::Retry => {}
                Wake::WatchClosed => watch = None,
                Wake::Timeout => return Err(ExecError::WaitTimeout),
                Wake::Cancelled => return Err(ExecError::Cancelled),
            }
        }
    }
}

/// Sleep until something suggests the lock may be free: a change event on
/// the volume's use keys, the poll fallback tick, or a terminal wake-up
/// (deadline, cancellation). Any event is only a hint; the caller retries
/// acquisition and may well lose the race.
async fn wake<F: Future<Output = ()>>(
    watch: Option<&mut WatchStream>,
    deadline: Option<Instant>,
    poll_interval: Duration,
    mut cancel: Pin<&mut F>,
) -> Wake {
    let poll_tick = tokio::time::sleep(poll_interval);
    tokio::pin!(poll_tick);
    let timeout = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout);

    // Biased so cancellation and the deadline always beat a simultaneous
    // wake-up hint, and a finished cancel future is never polled again on
    // a later pass.
    match watch {
        Some(stream) => tokio::select! {
            biased;
            () = &mut cancel => Wake::Cancelled,
            () = &mut timeout => Wake::Timeout,
            event = stream.next() => match event {
                Some(_) => Wake::Retry,
                None => Wake::WatchClosed,
            },
            () = &mut poll_tick => Wake::Retry,
        },
        None => tokio::select! {
            biased;
            () = &mut cancel => Wake::Cancelled,
            () = &mut timeout => Wake::Timeout,
            () = &mut poll_tick => Wake::Retry,
        },
    }
}
