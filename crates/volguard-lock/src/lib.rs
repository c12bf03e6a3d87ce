//! VolGuard Lock - distributed use-lock manager
//!
//! Coordinates exclusive "use" claims on shared block-storage volumes
//! across a fleet of hosts, on top of an external linearizable store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  UseLockManager  │  acquire / release / force_release / get / list
//! └────────┬─────────┘
//!          │ per acquired lock
//! ┌────────▼─────────┐
//! │    Heartbeat     │  renews the lease every TTL/3 until
//! │                  │  stopped (release) or lost (expiry)
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │   LeaseStore     │  linearizable create-if-absent,
//! │  (etcd / memory) │  compare-and-delete, watch
//! └──────────────────┘
//! ```
//!
//! The wait-and-execute coordinator ([`UseLockManager::wait_then_exec`])
//! blocks until the target lock frees, races to acquire it, runs a caller
//! action under the lock, and releases on every exit path.

pub mod exec;
pub mod heartbeat;
pub mod manager;

pub use exec::{ExecError, ExecOptions};
pub use heartbeat::{Heartbeat, LeaseState};
pub use manager::{UseFilter, UseHandle, UseLockManager};
