//! Runtime client.
//!
//! A [`RuntimeClient`] is embedded in every domain object (image, file
//! reader, transport...). It holds at most one runtime reference, forwards
//! `exec` calls to it, and reports backend failures as `error` events on the
//! owning object.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use shim_runtime_common::RuntimeError;
use tracing::{debug, warn};

use crate::event::EventTarget;
use crate::pool::{RuntimePool, RuntimeRequest};
use crate::runtime::{Runtime, RuntimeId, events};

/// What [`RuntimeClient::connect_runtime`] connects to.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// An existing runtime, typically shared from another domain object.
    Uid(RuntimeId),
    /// Resolve a runtime for these requirements.
    Request(RuntimeRequest),
}

impl From<RuntimeId> for ConnectTarget {
    fn from(uid: RuntimeId) -> Self {
        Self::Uid(uid)
    }
}

impl From<RuntimeRequest> for ConnectTarget {
    fn from(request: RuntimeRequest) -> Self {
        Self::Request(request)
    }
}

/// Per-domain-object handle to a pooled runtime.
///
/// Dropping the client releases its reference.
pub struct RuntimeClient {
    pool: Arc<RuntimePool>,
    owner: EventTarget,
    ruid: Mutex<Option<RuntimeId>>,
    last_request: Mutex<Option<RuntimeRequest>>,
}

impl RuntimeClient {
    /// Create a client for the domain object whose events are `owner`.
    pub fn new(pool: Arc<RuntimePool>, owner: EventTarget) -> Self {
        Self {
            pool,
            owner,
            ruid: Mutex::new(None),
            last_request: Mutex::new(None),
        }
    }

    /// Uid of the connected runtime, if any.
    pub fn ruid(&self) -> Option<RuntimeId> {
        self.ruid.lock().clone()
    }

    /// The owning domain object's event target.
    pub fn owner(&self) -> &EventTarget {
        &self.owner
    }

    /// The connected runtime, if it is still live.
    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        let uid = self.ruid()?;
        self.pool.get(&uid)
    }

    /// Connect to a runtime by uid or by requirements.
    ///
    /// Connecting replaces (and releases) any runtime held before. A stale
    /// uid is re-resolved from the last request this client made.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::StaleReference`] if the uid is dead and there is no
    ///   request to fall back on
    /// - any error from [`RuntimePool::resolve`]
    pub async fn connect_runtime(
        &self,
        target: impl Into<ConnectTarget>,
    ) -> Result<Arc<Runtime>, RuntimeError> {
        match target.into() {
            ConnectTarget::Uid(uid) => {
                if self.ruid().as_ref() == Some(&uid) {
                    if let Some(runtime) = self.pool.get(&uid) {
                        return Ok(runtime);
                    }
                }
                match self.pool.acquire(&uid) {
                    Ok(runtime) => {
                        self.set_ruid(Some(uid));
                        Ok(runtime)
                    }
                    Err(err) => {
                        let fallback = self.last_request.lock().clone();
                        match fallback {
                            Some(request) => {
                                debug!(uid = %uid, "Stale runtime reference, re-resolving");
                                self.resolve(request).await
                            }
                            None => Err(err),
                        }
                    }
                }
            }
            ConnectTarget::Request(request) => self.resolve(request).await,
        }
    }

    /// Forward `component.method` to the connected runtime.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::NotInitialized`] if nothing is connected, the
    ///   runtime is gone, or it is not ready yet
    /// - [`RuntimeError::NotSupported`] if the backend lacks the method
    /// - [`RuntimeError::Backend`] if the call failed; an `error` event is
    ///   triggered on the owner first
    pub fn exec(
        &self,
        component: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let runtime = self.live_runtime()?;
        match runtime.exec(&self.owner, component, method, args) {
            Err(RuntimeError::Backend(err)) => {
                warn!(
                    uid = %runtime.uid(),
                    component,
                    method,
                    error = %err,
                    "Backend call failed"
                );
                self.owner.trigger(
                    events::ERROR,
                    json!({
                        "component": component,
                        "method": method,
                        "message": err.to_string(),
                    }),
                );
                Err(RuntimeError::Backend(err))
            }
            other => other,
        }
    }

    /// Typed component of the connected runtime.
    ///
    /// # Errors
    ///
    /// Same as [`Runtime::component`], plus
    /// [`RuntimeError::NotInitialized`] if nothing is connected.
    pub fn component<T>(&self) -> Result<Arc<T>, RuntimeError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.live_runtime()?.component::<T>()
    }

    /// Release the held runtime, if any.
    pub fn release(&self) {
        self.set_ruid(None);
    }

    async fn resolve(&self, request: RuntimeRequest) -> Result<Arc<Runtime>, RuntimeError> {
        let runtime = self.pool.resolve(&request).await?;
        *self.last_request.lock() = Some(request);
        self.set_ruid(Some(runtime.uid().clone()));
        Ok(runtime)
    }

    // The new reference is already taken; the previous one is handed back.
    fn set_ruid(&self, uid: Option<RuntimeId>) {
        let previous = std::mem::replace(&mut *self.ruid.lock(), uid);
        if let Some(previous) = previous {
            self.pool.release(&previous);
        }
    }

    fn live_runtime(&self) -> Result<Arc<Runtime>, RuntimeError> {
        let Some(uid) = self.ruid() else {
            return Err(RuntimeError::not_initialized(None::<String>));
        };
        match self.pool.get(&uid) {
            Some(runtime) => Ok(runtime),
            None => {
                debug!(uid = %uid, "Dropping stale runtime reference");
                let mut ruid = self.ruid.lock();
                if ruid.as_ref() == Some(&uid) {
                    *ruid = None;
                }
                Err(RuntimeError::not_initialized(Some(uid.as_str())))
            }
        }
    }
}

impl Drop for RuntimeClient {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("owner", &self.owner.uid())
            .field("ruid", &self.ruid())
            .finish_non_exhaustive()
    }
}
