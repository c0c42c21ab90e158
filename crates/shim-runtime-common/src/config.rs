//! Configuration structures for shim-runtime.
//!
//! This module defines configuration options for the runtime core:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`PoolConfig`]: Runtime pool selection order and eviction policy
//! - [`InitConfig`]: Per-runtime initialization limits

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RuntimeKind;

/// Top-level runtime configuration.
///
/// It can be loaded from files (TOML, JSON) as part of a
/// [`ConfigFile`](crate::ConfigFile).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Runtime pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Runtime initialization configuration.
    #[serde(default)]
    pub init: InitConfig,
}

/// What the pool does with a runtime once its last reference is released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Destroy the runtime as soon as its reference count reaches zero.
    #[default]
    Immediate,

    /// Keep the runtime reusable until it has been idle for `idle_ttl_ms`.
    Idle,
}

/// Runtime pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Default backend order used when a request carries no preference.
    ///
    /// Registered kinds missing from this list are tried afterwards,
    /// in descending descriptor priority. Empty means priority order only.
    #[serde(default = "defaults::preferred_kinds")]
    pub preferred_kinds: Vec<RuntimeKind>,

    /// Eviction policy for unreferenced runtimes.
    #[serde(default)]
    pub eviction: EvictionPolicy,

    /// Idle time before an unreferenced runtime is evicted.
    ///
    /// Only effective with [`EvictionPolicy::Idle`].
    #[serde(default = "defaults::idle_ttl_ms")]
    pub idle_ttl_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            preferred_kinds: defaults::preferred_kinds(),
            eviction: EvictionPolicy::default(),
            idle_ttl_ms: defaults::idle_ttl_ms(),
        }
    }
}

impl PoolConfig {
    /// Get the idle TTL as a `Duration`.
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }
}

/// Runtime initialization configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InitConfig {
    /// Bounded interval for backend setup, in milliseconds.
    ///
    /// A backend that has not signalled readiness by then is marked failed.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix for generated shim container ids.
    #[serde(default = "defaults::container_prefix")]
    pub container_prefix: String,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            container_prefix: defaults::container_prefix(),
        }
    }
}

impl InitConfig {
    /// Get the init timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    use crate::RuntimeKind;

    pub fn preferred_kinds() -> Vec<RuntimeKind> {
        Vec::new()
    }

    pub const fn idle_ttl_ms() -> u64 {
        30_000
    }

    pub const fn timeout_ms() -> u64 {
        10_000
    }

    pub fn container_prefix() -> String {
        "shim".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.pool.preferred_kinds.is_empty());
        assert_eq!(config.pool.eviction, EvictionPolicy::Immediate);
        assert_eq!(config.pool.idle_ttl_ms, 30_000);
        assert_eq!(config.init.timeout_ms, 10_000);
        assert_eq!(config.init.container_prefix, "shim");
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.pool.preferred_kinds,
            deserialized.pool.preferred_kinds
        );
        assert_eq!(config.init.timeout_ms, deserialized.init.timeout_ms);
    }

    #[test]
    fn test_durations() {
        let init = InitConfig {
            timeout_ms: 500,
            ..Default::default()
        };
        assert_eq!(init.timeout(), Duration::from_millis(500));

        let pool = PoolConfig {
            idle_ttl_ms: 250,
            ..Default::default()
        };
        assert_eq!(pool.idle_ttl(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"pool": {"preferred_kinds": ["flash", "html4"], "eviction": "idle"}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(
            config.pool.preferred_kinds,
            vec![RuntimeKind::Flash, RuntimeKind::Html4]
        );
        assert_eq!(config.pool.eviction, EvictionPolicy::Idle);
        // Default values for unspecified fields
        assert_eq!(config.pool.idle_ttl_ms, 30_000);
        assert_eq!(config.init.timeout_ms, 10_000);
    }
}
