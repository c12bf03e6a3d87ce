//! Configuration types for VolGuard
//!
//! This module defines configuration structures used across components.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for VolGuard
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store connection configuration
    pub store: StoreConfig,
    /// Lock behavior configuration
    pub lock: LockConfig,
}

/// Connection settings for the external consistent store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints
    pub endpoints: Vec<String>,
    /// Key prefix used for namespacing
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            prefix: "/volguard".to_string(),
        }
    }
}

/// Lock acquisition and renewal settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease TTL applied when a policy does not set its own
    pub default_ttl_secs: u64,
    /// Polling fallback interval while waiting for a lock to free
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl LockConfig {
    /// Default lease TTL as a [`Duration`].
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Polling fallback interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.endpoints, vec!["http://localhost:2379"]);
        assert_eq!(config.store.prefix, "/volguard");
        assert_eq!(config.lock.default_ttl(), Duration::from_secs(30));
        assert_eq!(config.lock.poll_interval(), Duration::from_millis(1000));
    }
}
