//! Error types for shim-runtime.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for resolution, lifecycle and dispatch
//! - [`BackendError`]: Errors reported by a backend plugin

use thiserror::Error;

use crate::RuntimeKind;

/// Top-level runtime errors.
///
/// These errors cover the whole lifecycle of a runtime, from capability
/// resolution through initialization to `exec` dispatch.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A runtime was used before it reached the ready state, or the client
    /// has no runtime connected.
    #[error("Runtime not initialized{}", fmt_ruid(.ruid.as_deref()))]
    NotInitialized {
        /// The runtime id the caller held, if any.
        ruid: Option<String>,
    },

    /// The requested `component.method` is absent from the runtime's exec table.
    #[error("Not supported: {component}.{method}")]
    NotSupported {
        /// Component name (e.g. `Image`).
        component: String,
        /// Method name (e.g. `resize`).
        method: String,
    },

    /// No registered backend can satisfy the request, or every candidate
    /// failed to initialize.
    #[error("No capable runtime for [{required}] (attempted: {})", fmt_attempts(.attempts))]
    NoCapableRuntime {
        /// Human-readable rendering of the required capabilities.
        required: String,
        /// Candidate kinds that were tried, with their failure reason.
        attempts: Vec<(RuntimeKind, String)>,
    },

    /// Backend setup did not report readiness in time.
    #[error("Runtime {kind} init timeout after {timeout_ms}ms")]
    InitTimeout {
        /// Kind of the runtime that timed out.
        kind: RuntimeKind,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Backend setup reported an explicit failure.
    #[error("Runtime {kind} init failed: {reason}")]
    InitFailed {
        /// Kind of the runtime that failed.
        kind: RuntimeKind,
        /// Diagnostic from the backend.
        reason: String,
    },

    /// A cached runtime id no longer refers to a live runtime.
    #[error("Stale runtime reference: {ruid}")]
    StaleReference {
        /// The dangling runtime id.
        ruid: String,
    },

    /// No factory is registered for the requested backend kind.
    #[error("Unknown backend kind: {kind}")]
    UnknownBackend {
        /// The unregistered kind.
        kind: RuntimeKind,
    },

    /// A backend reported an error while executing a call.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The runtime pool was shut down.
    #[error("Runtime pool is shut down")]
    PoolClosed,
}

/// Errors reported by backend plugins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Backend-specific setup failed (plugin missing, embed refused, ...).
    #[error("Setup failed: {reason}")]
    SetupFailed {
        /// Description of the setup failure.
        reason: String,
    },

    /// A backend method failed while executing.
    #[error("{component}.{method} failed: {reason}")]
    ExecFailed {
        /// Component the call was made on.
        component: String,
        /// Method that failed.
        method: String,
        /// Description of the failure.
        reason: String,
    },

    /// Invalid argument was passed to a backend method.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `NotInitialized` error.
    pub fn not_initialized(ruid: Option<impl Into<String>>) -> Self {
        Self::NotInitialized {
            ruid: ruid.map(Into::into),
        }
    }

    /// Create a new `NotSupported` error.
    pub fn not_supported(component: impl Into<String>, method: impl Into<String>) -> Self {
        Self::NotSupported {
            component: component.into(),
            method: method.into(),
        }
    }

    /// Create a new `InitFailed` error.
    pub fn init_failed(kind: RuntimeKind, reason: impl Into<String>) -> Self {
        Self::InitFailed {
            kind,
            reason: reason.into(),
        }
    }

    /// Create a new `StaleReference` error.
    pub fn stale(ruid: impl Into<String>) -> Self {
        Self::StaleReference { ruid: ruid.into() }
    }

    /// Returns `true` if the caller should connect (again) before retrying.
    ///
    /// A stale reference counts as not-initialized.
    pub fn is_not_initialized(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized { .. } | Self::StaleReference { .. }
        )
    }

    /// Returns `true` if the request cannot be served by the resolved backend
    /// or by any backend at all.
    pub fn is_not_supported(&self) -> bool {
        matches!(
            self,
            Self::NotSupported { .. } | Self::NoCapableRuntime { .. }
        )
    }

    /// Returns `true` if this error came out of backend initialization.
    pub fn is_init_failure(&self) -> bool {
        matches!(self, Self::InitTimeout { .. } | Self::InitFailed { .. })
    }
}

impl BackendError {
    /// Create a new `SetupFailed` error.
    pub fn setup_failed(reason: impl Into<String>) -> Self {
        Self::SetupFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `ExecFailed` error.
    pub fn exec_failed(
        component: impl Into<String>,
        method: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ExecFailed {
            component: component.into(),
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

fn fmt_ruid(ruid: Option<&str>) -> String {
    ruid.map(|r| format!(": {r}")).unwrap_or_default()
}

fn fmt_attempts(attempts: &[(RuntimeKind, String)]) -> String {
    if attempts.is_empty() {
        return "none".to_string();
    }
    attempts
        .iter()
        .map(|(kind, reason)| format!("{kind}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}
