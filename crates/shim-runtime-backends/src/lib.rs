//! Backend plugin implementations for shim-runtime.
//!
//! This crate provides concrete implementations of the
//! [`BackendFactory`](shim_runtime_core::BackendFactory) contract.
//!
//! # Backends
//!
//! - [`scripted`]: Config-driven backend standing in for real browser runtimes
//! - [`logging`]: Tracing wrapper around any backend
//! - [`image`]: Typed `Image` component and its exec-table binding

pub mod image;
pub mod logging;
pub mod scripted;

pub use image::{IMAGE, ImageComponent, ImageInfo, ScriptedImage, image_exec_table};
pub use logging::{LoggingBackend, LoggingFactory};
pub use scripted::{ScriptedBackend, ScriptedFactory, ScriptedStats};
