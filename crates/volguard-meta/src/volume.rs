//! Volume metadata
//!
//! Records which volumes exist and under which policy. This is the
//! existence check the lock layer's callers rely on; the block-storage
//! backend that actually provisions volumes is outside this system.

use crate::{MetaError, MetaResult, MetadataClient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use volguard_common::{VolumeId, keys};
use volguard_store::{KeyValue, LeaseStore};

/// Metadata for one volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    /// Volume identity
    pub volume: VolumeId,
    /// Provisioned size in bytes
    pub size_bytes: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Creation options inherited from the policy or given at create time
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl VolumeMeta {
    /// New metadata record stamped with the current time.
    #[must_use]
    pub fn new(volume: VolumeId, size_bytes: u64) -> Self {
        Self {
            volume,
            size_bytes,
            created_at: Utc::now(),
            options: HashMap::new(),
        }
    }
}

impl<S: LeaseStore> MetadataClient<S> {
    /// Record a new volume. Create-only; an existing record is never
    /// overwritten.
    pub async fn create_volume(&self, meta: &VolumeMeta) -> MetaResult<()> {
        if self.volume_exists(&meta.volume).await? {
            return Err(MetaError::VolumeExists(meta.volume.clone()));
        }
        let value = serde_json::to_vec(meta)?;
        self.store
            .put(&keys::volume_key(&self.prefix, &meta.volume), &value)
            .await?;
        info!("created volume {}", meta.volume);
        Ok(())
    }

    /// Read one volume's metadata.
    pub async fn get_volume(&self, volume: &VolumeId) -> MetaResult<VolumeMeta> {
        match self
            .store
            .get(&keys::volume_key(&self.prefix, volume))
            .await?
        {
            Some(kv) => decode(&kv),
            None => Err(MetaError::VolumeNotFound(volume.clone())),
        }
    }

    /// All volumes of one policy, in key order.
    pub async fn list_volumes(&self, policy: &str) -> MetaResult<Vec<VolumeMeta>> {
        let prefix = keys::policy_volumes_prefix(&self.prefix, policy);
        let kvs = self.store.list(&prefix).await?;
        kvs.iter().map(decode).collect()
    }

    /// Every volume across all policies, in key order.
    pub async fn list_all_volumes(&self) -> MetaResult<Vec<VolumeMeta>> {
        let kvs = self.store.list(&keys::volumes_prefix(&self.prefix)).await?;
        kvs.iter().map(decode).collect()
    }

    /// Remove a volume's metadata. Refuses while any use lock is held on
    /// the volume unless `force` is given.
    pub async fn remove_volume(&self, volume: &VolumeId, force: bool) -> MetaResult<()> {
        if !self.volume_exists(volume).await? {
            return Err(MetaError::VolumeNotFound(volume.clone()));
        }
        if !force {
            let uses = self
                .store
                .list(&keys::volume_uses_prefix(&self.prefix, volume))
                .await?;
            if !uses.is_empty() {
                return Err(MetaError::VolumeInUse(volume.clone()));
            }
        }
        self.store
            .delete(&keys::volume_key(&self.prefix, volume))
            .await?;
        info!("removed volume {volume}");
        Ok(())
    }

    /// Whether a volume is known to the metadata layer.
    pub async fn volume_exists(&self, volume: &VolumeId) -> MetaResult<bool> {
        Ok(self
            .store
            .get(&keys::volume_key(&self.prefix, volume))
            .await?
            .is_some())
    }
}

fn decode(kv: &KeyValue) -> MetaResult<VolumeMeta> {
    Ok(serde_json::from_slice(&kv.value)?)
}
