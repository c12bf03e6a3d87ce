//! Policy documents and revision history
//!
//! The current document lives at `<prefix>/policies/<name>`; every upload
//! also appends an immutable copy under the archive prefix, so history
//! survives deletion of the current document.

use crate::{MetaError, MetaResult, MetadataClient};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use volguard_common::keys;
use volguard_store::LeaseStore;

/// One policy document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Lease TTL for use locks on this policy's volumes; falls back to
    /// the configured global default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_lock_ttl_secs: Option<u64>,

    /// Backend-specific volume creation options
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl<S: LeaseStore> MetadataClient<S> {
    /// Store a policy document and archive it as a new revision.
    /// Returns the revision id.
    pub async fn upload_policy(&self, name: &str, policy: &Policy) -> MetaResult<u64> {
        let value = serde_json::to_vec(policy)?;
        // Wall-clock revisions, bumped past the newest archive entry so
        // rapid uploads in the same millisecond still get distinct ids
        let last = self.policy_revisions(name).await?.last().copied();
        let revision = (Utc::now().timestamp_millis() as u64).max(last.map_or(0, |r| r + 1));
        self.store
            .put(&keys::policy_key(&self.prefix, name), &value)
            .await?;
        self.store
            .put(
                &keys::policy_archive_key(&self.prefix, name, revision),
                &value,
            )
            .await?;
        info!("uploaded policy {name} (rev {revision})");
        Ok(revision)
    }

    /// Read the current document of one policy.
    pub async fn get_policy(&self, name: &str) -> MetaResult<Policy> {
        match self.store.get(&keys::policy_key(&self.prefix, name)).await? {
            Some(kv) => Ok(serde_json::from_slice(&kv.value)?),
            None => Err(MetaError::PolicyNotFound(name.to_string())),
        }
    }

    /// Names of all current policies, in key order.
    pub async fn list_policies(&self) -> MetaResult<Vec<String>> {
        let prefix = keys::policies_prefix(&self.prefix);
        let kvs = self.store.list(&prefix).await?;
        Ok(kvs
            .into_iter()
            .filter_map(|kv| kv.key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Remove the current document of one policy. Archived revisions and
    /// the policy's volumes are unaffected.
    pub async fn delete_policy(&self, name: &str) -> MetaResult<()> {
        if self
            .store
            .delete(&keys::policy_key(&self.prefix, name))
            .await?
        {
            Ok(())
        } else {
            Err(MetaError::PolicyNotFound(name.to_string()))
        }
    }

    /// Revision ids of one policy, oldest first.
    pub async fn policy_revisions(&self, name: &str) -> MetaResult<Vec<u64>> {
        let prefix = keys::policy_archive_prefix(&self.prefix, name);
        let kvs = self.store.list(&prefix).await?;
        Ok(kvs
            .into_iter()
            .filter_map(|kv| {
                kv.key
                    .strip_prefix(&prefix)
                    .and_then(|rev| rev.parse().ok())
            })
            .collect())
    }

    /// Read one archived revision of a policy.
    pub async fn get_policy_revision(&self, name: &str, revision: u64) -> MetaResult<Policy> {
        let key = keys::policy_archive_key(&self.prefix, name, revision);
        match self.store.get(&key).await? {
            Some(kv) => Ok(serde_json::from_slice(&kv.value)?),
            None => Err(MetaError::RevisionNotFound(name.to_string(), revision)),
        }
    }

    /// Lock TTL for volumes of the given policy: the policy's own setting
    /// when present, the global default otherwise. A missing policy also
    /// yields the global default.
    pub async fn default_lock_ttl(&self, name: &str) -> MetaResult<Duration> {
        match self.get_policy(name).await {
            Ok(policy) => Ok(policy
                .use_lock_ttl_secs
                .map_or(self.default_ttl, Duration::from_secs)),
            Err(MetaError::PolicyNotFound(_)) => Ok(self.default_ttl),
            Err(e) => Err(e),
        }
    }
}
