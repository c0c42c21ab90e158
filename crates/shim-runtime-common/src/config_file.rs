//! Configuration file structures for shim-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`BackendEntry`]: A scripted backend registered at startup
//! - [`InitBehavior`]: How a scripted backend answers initialization

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CapabilityValue, RuntimeConfig, RuntimeKind};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.pool]
/// preferred_kinds = ["html5", "flash", "html4"]
/// eviction = "immediate"
///
/// [runtime.init]
/// timeout_ms = 5000
///
/// [[backends]]
/// kind = "html5"
/// priority = 100
/// capabilities = { create_canvas = true, use_data_uri_of = 32768 }
/// components = { Image = ["resize", "getInfo"] }
///
/// [[backends]]
/// kind = "flash"
/// priority = 50
/// init = "fail"
/// capabilities = { display_media = true }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (pool + init settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Backends to register at startup.
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML, or if two
    /// backend entries declare the same kind.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigFileError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.backends {
            if !seen.insert(&entry.kind) {
                return Err(ConfigFileError::DuplicateBackend {
                    kind: entry.kind.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// How a scripted backend answers its initialization handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitBehavior {
    /// Signal readiness after `init_delay_ms`.
    #[default]
    Ready,
    /// Report a setup failure after `init_delay_ms`.
    Fail,
    /// Never answer; the runtime's init timeout decides.
    Hang,
}

/// A backend declared in the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEntry {
    /// Backend kind (`html5`, `flash`, ... or any custom name).
    pub kind: RuntimeKind,

    /// Selection priority; higher is tried first when no order is preferred.
    #[serde(default)]
    pub priority: i32,

    /// Capabilities this backend provides, compared by value.
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityValue>,

    /// Initialization behavior.
    #[serde(default)]
    pub init: InitBehavior,

    /// Simulated setup latency in milliseconds.
    #[serde(default)]
    pub init_delay_ms: u64,

    /// Exposed `component -> [method]` table.
    #[serde(default)]
    pub components: BTreeMap<String, Vec<String>>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// The same backend kind was declared twice.
    #[error("Backend '{kind}' declared more than once")]
    DuplicateBackend { kind: String },
}
