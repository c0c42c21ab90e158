//! Common types, errors, and configuration for shim-runtime.
//!
//! This crate provides shared functionality used across the shim-runtime workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Runtime kinds and capability requirement types
//! - Configuration structures for the pool and runtime initialization

pub mod config;
pub mod config_file;
pub mod error;
pub mod types;

pub use config::{EvictionPolicy, InitConfig, PoolConfig, RuntimeConfig};
pub use config_file::{BackendEntry, ConfigFile, ConfigFileError, InitBehavior};
pub use error::{BackendError, RuntimeError};
pub use types::{CapabilitySet, CapabilityValue, Requirement, RuntimeKind, caps};
