//! Error taxonomy for VolGuard
//!
//! `Conflict` and `NotFound` are expected, recoverable outcomes of normal
//! operation, not faults. `LeaseExpired` signals that exclusivity has been
//! lost and dependent work must stop. `Unavailable` means the store could
//! not be reached or answered inconsistently; callers must fail closed and
//! never treat it as "lock acquired" or "lock free".

use crate::types::{LockClass, VolumeId};
use thiserror::Error;

/// Common result type for use-lock operations
pub type Result<T> = std::result::Result<T, UseError>;

/// Error type for use-lock operations
#[derive(Debug, Error)]
pub enum UseError {
    /// The lock is held by another holder
    #[error("use lock on {volume} ({class}) is held by {holder}")]
    Conflict {
        volume: VolumeId,
        class: LockClass,
        holder: String,
    },

    /// No use record exists for the volume and class
    #[error("no use lock found for {volume} ({class})")]
    NotFound { volume: VolumeId, class: LockClass },

    /// The holder's lease lapsed or was removed out from under it
    #[error("use lease expired for {volume} ({class})")]
    LeaseExpired { volume: VolumeId, class: LockClass },

    /// The store could not be reached or the request failed
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded
    #[error("corrupt use record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The wrapped action under wait-then-execute failed
    #[error("action failed: {0}")]
    ActionFailed(String),
}

impl UseError {
    /// Check if this is a lock-contention outcome
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if this is an absence outcome
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let vol = VolumeId::new("p", "v").unwrap();
        let conflict = UseError::Conflict {
            volume: vol.clone(),
            class: LockClass::Mount,
            holder: "hostA:1".to_string(),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());

        let missing = UseError::NotFound {
            volume: vol,
            class: LockClass::Snapshot,
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_conflict());
        assert!(!UseError::Unavailable("down".into()).is_conflict());
    }
}
