//! Runtime negotiation and dispatch core for shim-runtime.
//!
//! This crate decides which backend serves a request and routes calls to it:
//! - [`CapabilityRegistry`]: Which backend kinds satisfy which capabilities
//! - [`EventTarget`]: Priority-ordered, cancellable event dispatch
//! - [`Runtime`]: One backend instance and its lifecycle state machine
//! - [`RuntimePool`]: Cascading selection, reuse and reference counting
//! - [`RuntimeClient`]: Per-domain-object runtime handle
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Domain object (Image, FileReader, ...)     │
//! │  - EventTarget (owner events)                           │
//! │  - RuntimeClient (ruid, exec forwarding)                │
//! └─────────────────────────────────────────────────────────┘
//!                            │ connect_runtime / exec
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     RuntimePool                         │
//! │  (Shared, one lock over the runtime table)              │
//! │  - CapabilityRegistry built from BackendFactory set     │
//! │  - Candidate fallback, reuse by ConfigKey, refcounts    │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Runtime (Arc, per backend)              │
//! │  - Created → Initializing → Ready / Failed → Destroyed  │
//! │  - ShimContainer, ExecTable, ComponentSet               │
//! │  - Backend plugin (html5, flash, ...)                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod capability;
pub mod client;
pub mod component;
pub mod event;
pub mod pool;
pub mod runtime;

pub use backend::{
    Backend, BackendFactory, ConfigKey, ExecContext, ExecFn, ExecTable, RuntimeOptions,
    ShimContainer,
};
pub use capability::{BackendDescriptor, CapabilityRegistry, CapabilityRegistryBuilder, CapabilityTest};
pub use client::{ConnectTarget, RuntimeClient};
pub use component::ComponentSet;
pub use event::{Event, EventTarget, Handler, HandlerId, PROP_PRIORITY, TriggerOutcome};
pub use pool::{RuntimePool, RuntimePoolBuilder, RuntimeRequest, RuntimeSnapshot};
pub use runtime::{Runtime, RuntimeId, RuntimeState, events};
