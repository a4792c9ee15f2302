//! Cache configuration.
//!
//! Controls index size limits, entry lifetimes and backend selection via
//! `depcache.toml` (`[cache]` table) or `DEPCACHE__CACHE__*` variables.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Default values for cache configuration, shared with the settings loader.
pub const DEFAULT_MAX_REGISTRY_VALUE_SIZE: usize = 25_000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_METADATA_TTL_SECS: u64 = 86_400;
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// Cache configuration from `depcache.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Largest encoded size, in bytes, of one index list. Raise it when the backend
    /// compresses values.
    pub max_registry_value_size: usize,
    /// Maintain the invalidation indexes and honour change notifications.
    pub invalidate: bool,
    /// Name of the backend to use; `None` selects the default handle.
    pub backend: Option<String>,
    /// Lifetime of cached entries, in seconds.
    pub timeout_seconds: u64,
    /// Lifetime of index lists and contribution sets, in seconds.
    pub metadata_ttl_seconds: u64,
    /// Maximum number of values held by the in-process backend.
    pub memory_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_registry_value_size: DEFAULT_MAX_REGISTRY_VALUE_SIZE,
            invalidate: true,
            backend: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            metadata_ttl_seconds: DEFAULT_METADATA_TTL_SECS,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_registry_value_size: settings.max_registry_value_size.get(),
            invalidate: settings.invalidate,
            backend: settings.backend.clone(),
            timeout_seconds: settings.timeout.as_secs(),
            metadata_ttl_seconds: settings.metadata_ttl.as_secs(),
            memory_capacity: settings.memory_capacity.get(),
        }
    }
}

impl CacheConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_seconds)
    }

    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_registry_value_size, 25_000);
        assert!(config.invalidate);
        assert_eq!(config.backend, None);
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert_eq!(config.metadata_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.memory_capacity, 10_000);
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"timeout_seconds": 60, "backend": "fragments"}"#)
                .expect("valid config");
        assert_eq!(config.timeout_seconds, 60);
        assert_eq!(config.backend.as_deref(), Some("fragments"));
        assert_eq!(config.max_registry_value_size, 25_000);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            memory_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.memory_capacity_non_zero().get(), 1);
    }
}
