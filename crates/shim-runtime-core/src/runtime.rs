//! Runtime lifecycle.
//!
//! A [`Runtime`] wraps one [`Backend`] instance and moves through
//!
//! ```text
//! Created ──initialize()──▶ Initializing ──ready──▶ Ready
//!                                │                    │
//!                          fail / timeout             │
//!                                ▼                    │
//!                              Failed                 │
//!                                │                    │
//!                                └──────destroy()─────┴──▶ Destroyed
//! ```
//!
//! `Destroyed` is terminal and reachable from every state. Transitions are
//! check-and-set on a `tokio::sync::watch` channel, so a late backend
//! outcome can never resurrect a destroyed runtime.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use shim_runtime_common::{CapabilityValue, InitConfig, RuntimeError, RuntimeKind};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, ExecContext, ExecTable, RuntimeOptions, ShimContainer};
use crate::capability::CapabilityRegistry;
use crate::component::{ComponentSet, type_label};
use crate::event::EventTarget;

/// Names of the events a runtime (or client) triggers.
pub mod events {
    /// Runtime became ready. Fired once.
    pub const INIT: &str = "init";
    /// Runtime failed to initialize. Fired once.
    pub const INIT_ERROR: &str = "initerror";
    /// Runtime was destroyed.
    pub const DESTROY: &str = "destroy";
    /// A backend call failed; triggered on the calling domain object.
    pub const ERROR: &str = "error";
}

/// Unique runtime identifier (`rt_<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RuntimeId(String);

impl RuntimeId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(format!("rt_{}", uuid::Uuid::new_v4().simple()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RuntimeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RuntimeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    /// Constructed, setup not started.
    Created,
    /// Backend setup in progress.
    Initializing,
    /// Exec table installed; calls are accepted.
    Ready,
    /// Setup failed or timed out.
    Failed,
    /// Torn down. Terminal.
    Destroyed,
}

impl RuntimeState {
    /// Returns `true` while the runtime can still serve (or become able to
    /// serve) calls.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Created | Self::Initializing | Self::Ready)
    }

    /// Returns `true` once initialization has an outcome.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Created | Self::Initializing)
    }

    /// Lowercase state name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
enum Failure {
    Timeout(u64),
    Setup(String),
}

struct Dispatch {
    exec: ExecTable,
    components: ComponentSet,
}

/// A backend instance together with its lifecycle state.
///
/// Runtimes are shared as `Arc<Runtime>` between the pool and the clients
/// that resolved them. Only the pool destroys runtimes.
pub struct Runtime {
    uid: RuntimeId,
    kind: RuntimeKind,
    options: RuntimeOptions,
    backend: Arc<dyn Backend>,
    registry: Arc<CapabilityRegistry>,
    container: ShimContainer,
    events: EventTarget,
    init_timeout: Duration,
    state: watch::Sender<RuntimeState>,
    failure: Mutex<Option<Failure>>,
    // Held for writing across the Ready and Destroyed transitions.
    dispatch: RwLock<Option<Dispatch>>,
}

impl Runtime {
    /// Create a runtime in the `Created` state.
    pub fn new(
        uid: RuntimeId,
        backend: Arc<dyn Backend>,
        registry: Arc<CapabilityRegistry>,
        options: RuntimeOptions,
        init: &InitConfig,
    ) -> Self {
        let kind = backend.kind();
        let container = ShimContainer::new(
            format!("{}_{uid}", init.container_prefix),
            options.container.clone(),
        );
        let init_timeout = options.init_timeout.unwrap_or_else(|| init.timeout());
        let (state, _) = watch::channel(RuntimeState::Created);

        Self {
            events: EventTarget::with_uid(uid.to_string()),
            uid,
            kind,
            options,
            backend,
            registry,
            container,
            init_timeout,
            state,
            failure: Mutex::new(None),
            dispatch: RwLock::new(None),
        }
    }

    /// Runtime uid.
    pub fn uid(&self) -> &RuntimeId {
        &self.uid
    }

    /// Backend kind.
    pub fn kind(&self) -> &RuntimeKind {
        &self.kind
    }

    /// Options the runtime was created with.
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Current state.
    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Returns `true` if calls are accepted.
    pub fn is_ready(&self) -> bool {
        self.state() == RuntimeState::Ready
    }

    /// Event target for `init`, `initerror` and `destroy`.
    pub fn events(&self) -> &EventTarget {
        &self.events
    }

    /// The container the backend renders into.
    pub fn shim_container(&self) -> &ShimContainer {
        &self.container
    }

    /// Capability query against this runtime's kind.
    pub fn can(&self, capability: &str, value: &CapabilityValue) -> bool {
        self.registry.can(&self.kind, capability, value)
    }

    /// Start backend setup, or wait for the setup already in progress.
    ///
    /// Only the first caller drives the backend; later callers observe the
    /// same outcome.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::InitTimeout`] if setup exceeded the init timeout
    /// - [`RuntimeError::InitFailed`] if the backend reported a failure
    /// - [`RuntimeError::NotInitialized`] if the runtime was destroyed first
    #[instrument(skip(self), fields(uid = %self.uid, kind = %self.kind))]
    pub async fn initialize(&self) -> Result<(), RuntimeError> {
        if !self.transition(RuntimeState::Created, RuntimeState::Initializing) {
            return self.wait_ready().await;
        }

        debug!(
            container = %self.container.id(),
            timeout_ms = self.init_timeout.as_millis(),
            "Initializing runtime"
        );
        self.container.attach();

        let start = Instant::now();
        let setup = tokio::time::timeout(
            self.init_timeout,
            self.backend.initialize(&self.container, &self.options),
        )
        .await;

        match setup {
            Ok(Ok(())) => self.complete_ready(start.elapsed()),
            Ok(Err(err)) => self.complete_failed(Failure::Setup(err.to_string())),
            Err(_) => self.complete_failed(Failure::Timeout(duration_ms(self.init_timeout))),
        }

        self.outcome()
    }

    /// Wait until initialization has an outcome.
    ///
    /// # Errors
    ///
    /// Same as [`initialize`](Self::initialize).
    pub async fn wait_ready(&self) -> Result<(), RuntimeError> {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        if rx.wait_for(|s| s.is_settled()).await.is_err() {
            return Err(RuntimeError::not_initialized(Some(self.uid.as_str())));
        }
        self.outcome()
    }

    /// Dispatch `component.method` to the backend.
    ///
    /// `caller` is the event target of the domain object making the call.
    /// Backends trigger progress events on it.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::NotInitialized`] unless the runtime is ready
    /// - [`RuntimeError::NotSupported`] if the method is not in the exec table
    /// - [`RuntimeError::Backend`] if the backend call itself failed
    pub fn exec(
        &self,
        caller: &EventTarget,
        component: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let f = {
            let dispatch = self.dispatch.read();
            let Some(dispatch) = dispatch.as_ref() else {
                return Err(RuntimeError::not_initialized(Some(self.uid.as_str())));
            };
            dispatch
                .exec
                .get(component, method)
                .cloned()
                .ok_or_else(|| RuntimeError::not_supported(component, method))?
        };

        let ctx = ExecContext::new(self.uid.clone(), caller.clone());
        f(&ctx, args).map_err(RuntimeError::from)
    }

    /// Returns `true` if the exec table binds `component.method`.
    ///
    /// Always `false` before the runtime is ready.
    pub fn supports_method(&self, component: &str, method: &str) -> bool {
        self.dispatch
            .read()
            .as_ref()
            .is_some_and(|d| d.exec.contains(component, method))
    }

    /// Typed component lookup.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::NotInitialized`] unless the runtime is ready
    /// - [`RuntimeError::NotSupported`] if the backend has no such component
    pub fn component<T>(&self) -> Result<Arc<T>, RuntimeError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let dispatch = self.dispatch.read();
        let Some(dispatch) = dispatch.as_ref() else {
            return Err(RuntimeError::not_initialized(Some(self.uid.as_str())));
        };
        dispatch
            .components
            .get::<T>()
            .ok_or_else(|| RuntimeError::not_supported(type_label::<T>(), "*"))
    }

    /// Tear the runtime down.
    ///
    /// Idempotent. A backend still running setup keeps running, but its
    /// outcome is discarded. Only the pool calls this, after taking the
    /// runtime out of its table.
    pub(crate) fn destroy(&self) {
        let mut dispatch = self.dispatch.write();
        let mut previous = RuntimeState::Destroyed;
        let changed = self.state.send_if_modified(|state| {
            if *state == RuntimeState::Destroyed {
                return false;
            }
            previous = *state;
            *state = RuntimeState::Destroyed;
            true
        });
        if !changed {
            return;
        }
        *dispatch = None;
        drop(dispatch);

        self.backend.destroy();
        self.container.detach();

        info!(uid = %self.uid, kind = %self.kind, from = %previous, "Runtime destroyed");
        self.events.trigger(
            events::DESTROY,
            json!({ "uid": self.uid, "kind": self.kind.as_str(), "state": previous }),
        );
        self.events.destroy();
    }

    fn complete_ready(&self, elapsed: Duration) {
        let mut dispatch = self.dispatch.write();
        if !self.transition(RuntimeState::Initializing, RuntimeState::Ready) {
            debug!("Runtime destroyed during setup, discarding ready signal");
            return;
        }
        let exec = self.backend.exec_table();
        let components = self.backend.components();
        debug!(
            methods = exec.len(),
            components = components.len(),
            "Installing exec table"
        );
        *dispatch = Some(Dispatch { exec, components });
        drop(dispatch);

        info!(duration_ms = elapsed.as_millis(), "Runtime ready");
        self.events.trigger(
            events::INIT,
            json!({ "uid": self.uid, "kind": self.kind.as_str() }),
        );
    }

    fn complete_failed(&self, failure: Failure) {
        *self.failure.lock() = Some(failure.clone());
        if !self.transition(RuntimeState::Initializing, RuntimeState::Failed) {
            debug!("Runtime destroyed during setup, discarding failure");
            return;
        }
        self.container.detach();

        let reason = self.failure_error(&failure).to_string();
        warn!(reason = %reason, "Runtime initialization failed");
        self.events.trigger(
            events::INIT_ERROR,
            json!({ "uid": self.uid, "kind": self.kind.as_str(), "reason": reason }),
        );
    }

    fn outcome(&self) -> Result<(), RuntimeError> {
        match self.state() {
            RuntimeState::Ready => Ok(()),
            RuntimeState::Failed => match self.failure.lock().clone() {
                Some(failure) => Err(self.failure_error(&failure)),
                None => Err(RuntimeError::init_failed(self.kind.clone(), "unknown")),
            },
            RuntimeState::Created | RuntimeState::Initializing | RuntimeState::Destroyed => {
                Err(RuntimeError::not_initialized(Some(self.uid.as_str())))
            }
        }
    }

    fn failure_error(&self, failure: &Failure) -> RuntimeError {
        match failure {
            Failure::Timeout(timeout_ms) => RuntimeError::InitTimeout {
                kind: self.kind.clone(),
                timeout_ms: *timeout_ms,
            },
            Failure::Setup(reason) => RuntimeError::init_failed(self.kind.clone(), reason),
        }
    }

    fn transition(&self, from: RuntimeState, to: RuntimeState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("uid", &self.uid)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
