//! Core type definitions for VolGuard
//!
//! This module defines the fundamental types used throughout the system:
//! volume identity, lock classes, holder identity, and the use record that
//! represents one held exclusive claim.

use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Error produced when parsing or validating a volume identifier
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VolumeIdError {
    #[error("volume id must be of the form <policy>/<volume>: {0}")]
    Malformed(String),

    #[error("volume id segment is empty")]
    EmptySegment,
}

/// Identity of a shared storage object: a (policy, volume) pair.
///
/// Immutable once the volume exists; rendered as `policy/volume`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId {
    /// Policy the volume belongs to
    pub policy: String,
    /// Volume name within the policy
    pub name: String,
}

impl VolumeId {
    /// Create a volume id from its two segments.
    pub fn new(policy: impl Into<String>, name: impl Into<String>) -> Result<Self, VolumeIdError> {
        let policy = policy.into();
        let name = name.into();
        if policy.is_empty() || name.is_empty() {
            return Err(VolumeIdError::EmptySegment);
        }
        if policy.contains('/') || name.contains('/') {
            return Err(VolumeIdError::Malformed(format!("{policy}/{name}")));
        }
        Ok(Self { policy, name })
    }
}

impl FromStr for VolumeId {
    type Err = VolumeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((policy, name)) => Self::new(policy, name),
            None => Err(VolumeIdError::Malformed(s.to_string())),
        }
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.policy, self.name)
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({}/{})", self.policy, self.name)
    }
}

/// Purpose for which exclusivity over a volume is claimed.
///
/// The two classes are tracked as separate store keys but are mutually
/// exclusive by default: acquiring either class fails while the other is
/// held on the same volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockClass {
    /// Exclusive read/write attachment of the volume to one host
    Mount,
    /// Point-in-time copy operations
    Snapshot,
}

impl LockClass {
    /// The class that must be absent for this class to be acquired.
    #[must_use]
    pub const fn opposing(self) -> Self {
        match self {
            Self::Mount => Self::Snapshot,
            Self::Snapshot => Self::Mount,
        }
    }

    /// Store key segment for this class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for LockClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the host + process that owns a use record.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[display("{_0}")]
pub struct HolderId(String);

impl HolderId {
    /// Holder identity for the current process: `<hostname>:<pid>`.
    #[must_use]
    pub fn local() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self(format!("{host}:{}", std::process::id()))
    }

    /// Get the holder identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HolderId({})", self.0)
    }
}

/// Handle of a store lease backing a use record.
///
/// Lease ids are issued by the external store; `0` never names a live lease.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into, Default,
)]
#[display("{_0:x}")]
pub struct LeaseId(i64);

impl LeaseId {
    /// Raw store-side lease id.
    #[must_use]
    pub const fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseId({:x})", self.0)
    }
}

/// One held exclusive claim on a volume.
///
/// Created on successful acquisition, mutated only by store-side lease
/// renewal, and removed by release, force-removal, or lease expiry. Any
/// change that is not a pure TTL renewal is a delete + recreate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UseRecord {
    /// Volume the claim is on
    pub volume: VolumeId,
    /// Lock class of the claim
    pub class: LockClass,
    /// Identity of the owning host + process
    pub holder: HolderId,
    /// When the claim was acquired
    pub acquired_at: DateTime<Utc>,
    /// Store lease backing the claim
    pub lease: LeaseId,
    /// Lease TTL in seconds at acquisition time
    pub ttl_secs: u64,
}

impl UseRecord {
    /// Lease TTL as a [`Duration`].
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_id_parse() {
        let id: VolumeId = "policy1/db".parse().unwrap();
        assert_eq!(id.policy, "policy1");
        assert_eq!(id.name, "db");
        assert_eq!(id.to_string(), "policy1/db");
    }

    #[test]
    fn test_volume_id_rejects_malformed() {
        assert!("no-slash".parse::<VolumeId>().is_err());
        assert!("/empty-policy".parse::<VolumeId>().is_err());
        assert!("policy/".parse::<VolumeId>().is_err());
        assert!(VolumeId::new("a/b", "c").is_err());
    }

    #[test]
    fn test_volume_id_rejects_nested_slash() {
        assert!("p/v/extra".parse::<VolumeId>().is_err());
    }

    #[test]
    fn test_lock_class_opposing() {
        assert_eq!(LockClass::Mount.opposing(), LockClass::Snapshot);
        assert_eq!(LockClass::Snapshot.opposing(), LockClass::Mount);
    }

    #[test]
    fn test_holder_id_local() {
        let holder = HolderId::local();
        assert!(holder.as_str().contains(':'));
    }

    #[test]
    fn test_use_record_roundtrip() {
        let record = UseRecord {
            volume: VolumeId::new("p", "v").unwrap(),
            class: LockClass::Mount,
            holder: HolderId::from("hostA:42".to_string()),
            acquired_at: Utc::now(),
            lease: LeaseId::from(7),
            ttl_secs: 30,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: UseRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.ttl(), Duration::from_secs(30));
    }
}
