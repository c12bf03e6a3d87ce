//! Store key layout
//!
//! All persisted state lives under one operator-chosen prefix:
//!
//! ```text
//! <prefix>/uses/<policy>/<volume>/<class>       serialized UseRecord
//! <prefix>/policies/<name>                      current policy document
//! <prefix>/archives/policies/<name>/<rev>       immutable policy revisions
//! <prefix>/volumes/<policy>/<volume>            volume metadata
//! ```
//!
//! Watches on a volume's use prefix observe both lock classes in one
//! subscription.

use crate::types::{LockClass, VolumeId};

/// Key of the use record for one (volume, class) pair.
#[must_use]
pub fn use_key(prefix: &str, volume: &VolumeId, class: LockClass) -> String {
    format!(
        "{prefix}/uses/{}/{}/{}",
        volume.policy,
        volume.name,
        class.as_str()
    )
}

/// Prefix covering both lock classes of one volume.
#[must_use]
pub fn volume_uses_prefix(prefix: &str, volume: &VolumeId) -> String {
    format!("{prefix}/uses/{}/{}/", volume.policy, volume.name)
}

/// Prefix covering every use record in the namespace.
#[must_use]
pub fn uses_prefix(prefix: &str) -> String {
    format!("{prefix}/uses/")
}

/// Key of the current document for one policy.
#[must_use]
pub fn policy_key(prefix: &str, name: &str) -> String {
    format!("{prefix}/policies/{name}")
}

/// Prefix covering every current policy document.
#[must_use]
pub fn policies_prefix(prefix: &str) -> String {
    format!("{prefix}/policies/")
}

/// Key of one archived policy revision. Revisions are zero-padded so the
/// store's key order is also chronological order.
#[must_use]
pub fn policy_archive_key(prefix: &str, name: &str, revision: u64) -> String {
    format!("{prefix}/archives/policies/{name}/{revision:020}")
}

/// Prefix covering the archived revisions of one policy.
#[must_use]
pub fn policy_archive_prefix(prefix: &str, name: &str) -> String {
    format!("{prefix}/archives/policies/{name}/")
}

/// Key of the metadata document for one volume.
#[must_use]
pub fn volume_key(prefix: &str, volume: &VolumeId) -> String {
    format!("{prefix}/volumes/{}/{}", volume.policy, volume.name)
}

/// Prefix covering the volumes of one policy.
#[must_use]
pub fn policy_volumes_prefix(prefix: &str, policy: &str) -> String {
    format!("{prefix}/volumes/{policy}/")
}

/// Prefix covering every volume in the namespace.
#[must_use]
pub fn volumes_prefix(prefix: &str) -> String {
    format!("{prefix}/volumes/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol() -> VolumeId {
        VolumeId::new("policy1", "db").unwrap()
    }

    #[test]
    fn test_use_key_layout() {
        assert_eq!(
            use_key("/volguard", &vol(), LockClass::Mount),
            "/volguard/uses/policy1/db/mount"
        );
        assert_eq!(
            use_key("/volguard", &vol(), LockClass::Snapshot),
            "/volguard/uses/policy1/db/snapshot"
        );
    }

    #[test]
    fn test_volume_uses_prefix_covers_both_classes() {
        let p = volume_uses_prefix("/volguard", &vol());
        assert!(use_key("/volguard", &vol(), LockClass::Mount).starts_with(&p));
        assert!(use_key("/volguard", &vol(), LockClass::Snapshot).starts_with(&p));
    }

    #[test]
    fn test_archive_keys_sort_chronologically() {
        let early = policy_archive_key("/v", "p", 99);
        let late = policy_archive_key("/v", "p", 100);
        assert!(early < late);
    }
}
