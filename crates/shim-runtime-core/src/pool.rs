//! Runtime pool.
//!
//! The [`RuntimePool`] owns every live [`Runtime`]. It resolves capability
//! requests to runtimes (reusing compatible ones), counts references, and
//! evicts runtimes nobody holds anymore.
//!
//! # Resolution
//!
//! 1. Candidates are the kinds whose required capabilities all match, in
//!    the request's preferred order or, failing that, the configured order
//!    followed by descriptor priority.
//! 2. For each candidate, a live runtime with the same [`ConfigKey`] is
//!    reused. Otherwise a new one is created and initialized.
//! 3. If initialization fails, the runtime is evicted and the next
//!    candidate is tried. A kind is never retried within one resolution.
//!
//! Concurrent resolutions of the same key share one runtime: lookup,
//! creation and the reference increment happen under one lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use shim_runtime_common::{
    CapabilitySet, EvictionPolicy, RuntimeConfig, RuntimeError, RuntimeKind,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendFactory, ConfigKey, RuntimeOptions};
use crate::capability::CapabilityRegistry;
use crate::runtime::{Runtime, RuntimeId, RuntimeState};

/// A request for a runtime.
#[derive(Debug, Clone, Default)]
pub struct RuntimeRequest {
    /// Required and optional capabilities.
    pub capabilities: CapabilitySet,

    /// Kinds to try, in order. Empty means "any matching kind".
    pub preferred: Vec<RuntimeKind>,

    /// Per-runtime options.
    pub options: RuntimeOptions,
}

impl RuntimeRequest {
    /// Create a request for `capabilities`.
    ///
    /// Optional capabilities are carried into the runtime options.
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self {
            options: RuntimeOptions::for_capabilities(&capabilities),
            capabilities,
            preferred: Vec::new(),
        }
    }

    /// Restrict and order the candidate kinds.
    #[must_use]
    pub fn prefer<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = RuntimeKind>,
    {
        self.preferred = kinds.into_iter().collect();
        self
    }

    /// Replace the runtime options.
    ///
    /// The preferences always follow the request's optional capabilities,
    /// whatever `options` carries.
    #[must_use]
    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = RuntimeOptions {
            preferences: self.capabilities.optional().cloned().collect(),
            ..options
        };
        self
    }
}

/// Point-in-time view of one pooled runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSnapshot {
    /// Runtime uid.
    pub uid: RuntimeId,
    /// Backend kind.
    pub kind: String,
    /// Lifecycle state.
    pub state: RuntimeState,
    /// Outstanding references.
    pub refs: usize,
}

struct PoolEntry {
    runtime: Arc<Runtime>,
    key: ConfigKey,
    refs: usize,
    idle_since: Option<Instant>,
}

#[derive(Default)]
struct PoolTable {
    entries: HashMap<RuntimeId, PoolEntry>,
    by_key: HashMap<ConfigKey, RuntimeId>,
    closed: bool,
}

impl PoolTable {
    fn remove(&mut self, uid: &RuntimeId) -> Option<Arc<Runtime>> {
        let entry = self.entries.remove(uid)?;
        if self.by_key.get(&entry.key) == Some(uid) {
            self.by_key.remove(&entry.key);
        }
        Some(entry.runtime)
    }
}

struct Checkout {
    runtime: Arc<Runtime>,
    created: bool,
    stale: Option<Arc<Runtime>>,
}

/// Owner of all live runtimes.
pub struct RuntimePool {
    registry: Arc<CapabilityRegistry>,
    factories: HashMap<RuntimeKind, Arc<dyn BackendFactory>>,
    config: RuntimeConfig,
    table: Mutex<PoolTable>,
}

impl RuntimePool {
    /// Create a builder.
    pub fn builder() -> RuntimePoolBuilder {
        RuntimePoolBuilder::default()
    }

    /// The registry built from the registered factories.
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Pool configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Resolve a request to a ready runtime.
    ///
    /// On success the caller holds one reference and must hand it back with
    /// [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::NoCapableRuntime`] if no kind matches, or every
    ///   candidate failed to initialize (the attempts are listed)
    /// - [`RuntimeError::PoolClosed`] after [`shutdown`](Self::shutdown)
    #[instrument(skip(self, request), fields(required = %request.capabilities))]
    pub async fn resolve(&self, request: &RuntimeRequest) -> Result<Arc<Runtime>, RuntimeError> {
        if self.table.lock().closed {
            return Err(RuntimeError::PoolClosed);
        }

        let candidates = self.candidates(request);
        debug!(candidates = ?candidates, "Resolving runtime");

        let mut attempts = Vec::new();
        for kind in candidates {
            let checkout = match self.checkout(&kind, &request.options) {
                Ok(checkout) => checkout,
                Err(RuntimeError::PoolClosed) => return Err(RuntimeError::PoolClosed),
                Err(err) => {
                    warn!(kind = %kind, error = %err, "Backend could not be created");
                    attempts.push((kind, err.to_string()));
                    continue;
                }
            };
            if let Some(stale) = checkout.stale {
                stale.destroy();
            }

            let runtime = checkout.runtime;
            let reservation = Reservation::new(self, runtime.uid().clone());
            if checkout.created {
                spawn_initialize(&runtime);
            }

            match runtime.wait_ready().await {
                Ok(()) => {
                    reservation.keep();
                    info!(
                        uid = %runtime.uid(),
                        kind = %kind,
                        reused = !checkout.created,
                        "Runtime resolved"
                    );
                    return Ok(runtime);
                }
                Err(err) => {
                    reservation.keep();
                    warn!(kind = %kind, error = %err, "Runtime unavailable, falling back");
                    self.evict(runtime.uid());
                    attempts.push((kind, err.to_string()));
                }
            }
        }

        Err(RuntimeError::NoCapableRuntime {
            required: request.capabilities.to_string(),
            attempts,
        })
    }

    /// Take another reference to a live runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::StaleReference`] if `uid` is not a live
    /// pooled runtime.
    pub fn acquire(&self, uid: &RuntimeId) -> Result<Arc<Runtime>, RuntimeError> {
        let mut table = self.table.lock();
        match table.entries.get_mut(uid) {
            Some(entry) if entry.runtime.state().is_live() => {
                entry.refs += 1;
                entry.idle_since = None;
                Ok(entry.runtime.clone())
            }
            _ => Err(RuntimeError::stale(uid.as_str())),
        }
    }

    /// Look up a live runtime without taking a reference.
    pub fn get(&self, uid: &RuntimeId) -> Option<Arc<Runtime>> {
        self.table
            .lock()
            .entries
            .get(uid)
            .filter(|e| e.runtime.state().is_live())
            .map(|e| e.runtime.clone())
    }

    /// Drop one reference.
    ///
    /// Returns `false` if `uid` is not pooled. With
    /// [`EvictionPolicy::Immediate`] the last release destroys the runtime.
    pub fn release(&self, uid: &RuntimeId) -> bool {
        let evicted = {
            let mut table = self.table.lock();
            let Some(entry) = table.entries.get_mut(uid) else {
                return false;
            };
            entry.refs = entry.refs.saturating_sub(1);
            debug!(uid = %uid, refs = entry.refs, "Runtime released");
            if entry.refs > 0 {
                return true;
            }
            match self.config.pool.eviction {
                EvictionPolicy::Immediate => table.remove(uid),
                EvictionPolicy::Idle => {
                    entry.idle_since = Some(Instant::now());
                    None
                }
            }
        };

        if let Some(runtime) = evicted {
            runtime.destroy();
        }
        true
    }

    /// Destroy unreferenced runtimes idle for longer than the configured TTL.
    ///
    /// Returns the number of runtimes evicted.
    pub fn evict_idle(&self) -> usize {
        let ttl = self.config.pool.idle_ttl();
        let now = Instant::now();
        let evicted: Vec<Arc<Runtime>> = {
            let mut table = self.table.lock();
            let expired: Vec<RuntimeId> = table
                .entries
                .iter()
                .filter(|(_, e)| {
                    e.refs == 0 && e.idle_since.is_some_and(|since| now - since >= ttl)
                })
                .map(|(uid, _)| uid.clone())
                .collect();
            expired.iter().filter_map(|uid| table.remove(uid)).collect()
        };

        for runtime in &evicted {
            runtime.destroy();
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted idle runtimes");
        }
        evicted.len()
    }

    /// Remove and destroy a runtime regardless of its reference count.
    pub fn evict(&self, uid: &RuntimeId) -> bool {
        let removed = self.table.lock().remove(uid);
        match removed {
            Some(runtime) => {
                runtime.destroy();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every pooled runtime, ordered by kind then uid.
    pub fn snapshot(&self) -> Vec<RuntimeSnapshot> {
        let mut out: Vec<RuntimeSnapshot> = self
            .table
            .lock()
            .entries
            .values()
            .map(|e| RuntimeSnapshot {
                uid: e.runtime.uid().clone(),
                kind: e.runtime.kind().to_string(),
                state: e.runtime.state(),
                refs: e.refs,
            })
            .collect();
        out.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.uid.cmp(&b.uid)));
        out
    }

    /// Number of pooled runtimes.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Returns `true` if no runtime is pooled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every runtime and refuse further resolutions. Idempotent.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Runtime>> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.by_key.clear();
            table.entries.drain().map(|(_, e)| e.runtime).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Shutting down runtime pool");
        for runtime in drained {
            runtime.destroy();
        }
    }

    fn candidates(&self, request: &RuntimeRequest) -> Vec<RuntimeKind> {
        let matching = self.registry.matching(&request.capabilities);
        let order: &[RuntimeKind] = if request.preferred.is_empty() {
            &self.config.pool.preferred_kinds
        } else {
            &request.preferred
        };

        let mut out: Vec<RuntimeKind> = Vec::with_capacity(matching.len());
        for kind in order {
            if matching.contains(kind) && !out.contains(kind) {
                out.push(kind.clone());
            }
        }
        // An explicit request preference is exhaustive.
        if request.preferred.is_empty() {
            for kind in matching {
                if !out.contains(&kind) {
                    out.push(kind);
                }
            }
        }
        out
    }

    fn checkout(
        &self,
        kind: &RuntimeKind,
        options: &RuntimeOptions,
    ) -> Result<Checkout, RuntimeError> {
        let key = options.config_key(kind);
        let mut table = self.table.lock();
        if table.closed {
            return Err(RuntimeError::PoolClosed);
        }

        let mut stale = None;
        if let Some(uid) = table.by_key.get(&key).cloned() {
            if let Some(entry) = table.entries.get_mut(&uid) {
                if entry.runtime.state().is_live() {
                    entry.refs += 1;
                    entry.idle_since = None;
                    debug!(uid = %uid, refs = entry.refs, "Reusing runtime");
                    return Ok(Checkout {
                        runtime: entry.runtime.clone(),
                        created: false,
                        stale: None,
                    });
                }
            }
            stale = table.remove(&uid);
        }

        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| RuntimeError::UnknownBackend { kind: kind.clone() })?;
        let uid = RuntimeId::generate();
        let backend = factory.create(&uid)?;
        let runtime = Arc::new(Runtime::new(
            uid.clone(),
            backend,
            self.registry.clone(),
            options.clone(),
            &self.config.init,
        ));
        debug!(uid = %uid, kind = %kind, "Created runtime");

        table.entries.insert(
            uid.clone(),
            PoolEntry {
                runtime: runtime.clone(),
                key: key.clone(),
                refs: 1,
                idle_since: None,
            },
        );
        table.by_key.insert(key, uid);

        Ok(Checkout {
            runtime,
            created: true,
            stale,
        })
    }
}

impl Drop for RuntimePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RuntimePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimePool")
            .field("kinds", &self.registry.descriptors())
            .field("runtimes", &self.len())
            .finish_non_exhaustive()
    }
}

fn spawn_initialize(runtime: &Arc<Runtime>) {
    let runtime = runtime.clone();
    tokio::spawn(async move {
        if let Err(err) = runtime.initialize().await {
            debug!(uid = %runtime.uid(), error = %err, "Initialization did not complete");
        }
    });
}

/// Releases a checked-out reference if resolution is abandoned.
struct Reservation<'a> {
    pool: &'a RuntimePool,
    uid: Option<RuntimeId>,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a RuntimePool, uid: RuntimeId) -> Self {
        Self {
            pool,
            uid: Some(uid),
        }
    }

    fn keep(mut self) {
        self.uid = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(uid) = self.uid.take() {
            self.pool.release(&uid);
        }
    }
}

/// Builder for [`RuntimePool`].
#[derive(Default)]
pub struct RuntimePoolBuilder {
    factories: Vec<Arc<dyn BackendFactory>>,
    config: RuntimeConfig,
}

impl RuntimePoolBuilder {
    /// Register a backend factory. A later factory for the same kind
    /// replaces the earlier one.
    #[must_use]
    pub fn backend(self, factory: impl BackendFactory) -> Self {
        self.shared_backend(Arc::new(factory))
    }

    /// Register an already shared backend factory.
    #[must_use]
    pub fn shared_backend(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the pool and its capability registry.
    #[must_use]
    pub fn build(self) -> RuntimePool {
        let mut registry = CapabilityRegistry::builder();
        let mut factories = HashMap::new();

        for factory in self.factories {
            let descriptor = factory.descriptor();
            let kind = descriptor.kind.clone();
            registry = registry.backend(descriptor);
            for (name, test) in factory.capabilities() {
                registry = registry.register(kind.clone(), name, test);
            }
            factories.insert(kind, factory);
        }

        let registry = registry.build();
        debug!(kinds = registry.descriptors().len(), "Runtime pool built");

        RuntimePool {
            registry: Arc::new(registry),
            factories,
            config: self.config,
            table: Mutex::new(PoolTable::default()),
        }
    }
}

impl fmt::Debug for RuntimePoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimePoolBuilder")
            .field("factories", &self.factories)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ExecTable, ShimContainer};
    use crate::capability::{BackendDescriptor, CapabilityTest};
    use async_trait::async_trait;
    use shim_runtime_common::{BackendError, caps};

    #[derive(Debug)]
    struct Plain(RuntimeKind, i32);

    #[derive(Debug)]
    struct PlainBackend(RuntimeKind);

    #[async_trait]
    impl Backend for PlainBackend {
        fn kind(&self) -> RuntimeKind {
            self.0.clone()
        }

        async fn initialize(
            &self,
            _container: &ShimContainer,
            _options: &RuntimeOptions,
        ) -> Result<(), BackendError> {
            Ok(())
        }

        fn exec_table(&self) -> ExecTable {
            ExecTable::new()
        }
    }

    impl BackendFactory for Plain {
        fn descriptor(&self) -> BackendDescriptor {
            BackendDescriptor::new(self.0.clone(), self.1)
        }

        fn capabilities(&self) -> Vec<(String, CapabilityTest)> {
            vec![(caps::READ_BINARY.to_string(), CapabilityTest::value(true))]
        }

        fn create(&self, _uid: &RuntimeId) -> Result<Arc<dyn Backend>, BackendError> {
            Ok(Arc::new(PlainBackend(self.0.clone())))
        }
    }

    fn pool(config: RuntimeConfig) -> RuntimePool {
        RuntimePool::builder()
            .backend(Plain(RuntimeKind::Html4, 10))
            .backend(Plain(RuntimeKind::Html5, 100))
            .backend(Plain(RuntimeKind::Flash, 50))
            .config(config)
            .build()
    }

    #[test]
    fn test_candidates_priority_order() {
        let pool = pool(RuntimeConfig::default());
        let req = RuntimeRequest::new(CapabilitySet::new().require(caps::READ_BINARY, true));
        assert_eq!(
            pool.candidates(&req),
            vec![RuntimeKind::Html5, RuntimeKind::Flash, RuntimeKind::Html4]
        );
    }

    #[test]
    fn test_candidates_configured_order_then_priority() {
        let mut config = RuntimeConfig::default();
        config.pool.preferred_kinds = vec![RuntimeKind::Html4, RuntimeKind::Silverlight];
        let pool = pool(config);

        let req = RuntimeRequest::new(CapabilitySet::new());
        assert_eq!(
            pool.candidates(&req),
            vec![RuntimeKind::Html4, RuntimeKind::Html5, RuntimeKind::Flash]
        );
    }

    #[test]
    fn test_candidates_explicit_preference_is_exhaustive() {
        let pool = pool(RuntimeConfig::default());
        let req = RuntimeRequest::new(CapabilitySet::new())
            .prefer([RuntimeKind::Flash, RuntimeKind::Flash, RuntimeKind::Html4]);
        assert_eq!(
            pool.candidates(&req),
            vec![RuntimeKind::Flash, RuntimeKind::Html4]
        );
    }

    #[test]
    fn test_candidates_unmatched() {
        let pool = pool(RuntimeConfig::default());
        let req = RuntimeRequest::new(CapabilitySet::new().require("teleport", true));
        assert!(pool.candidates(&req).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_unknown_uid() {
        let pool = pool(RuntimeConfig::default());
        assert!(!pool.release(&RuntimeId::from("rt_missing")));
        assert!(pool.acquire(&RuntimeId::from("rt_missing")).is_err());
    }

    // Records whether the pool still lists the runtime when `destroy` fires.
    fn watch_destroy(pool: &Arc<RuntimePool>, rt: &Runtime) -> Arc<Mutex<Vec<bool>>> {
        let listed = Arc::new(Mutex::new(Vec::new()));
        let (weak, uid, seen) = (Arc::downgrade(pool), rt.uid().clone(), listed.clone());
        rt.events().bind(crate::runtime::events::DESTROY, move |_| {
            if let Some(pool) = weak.upgrade() {
                seen.lock().push(pool.get(&uid).is_some());
            }
        });
        listed
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_leaves_table_before_destroy() {
        let pool = Arc::new(pool(RuntimeConfig::default()));
        let req = RuntimeRequest::new(CapabilitySet::new());

        let a = pool.resolve(&req).await.unwrap();
        let b = pool.resolve(&req).await.unwrap();
        assert_eq!(a.uid(), b.uid());
        let released = watch_destroy(&pool, &a);

        assert!(pool.release(a.uid()));
        assert_eq!(pool.snapshot()[0].refs, 1);
        assert!(pool.release(b.uid()));
        assert_eq!(a.state(), RuntimeState::Destroyed);
        assert!(pool.snapshot().is_empty());
        assert_eq!(*released.lock(), vec![false]);
        assert!(!pool.release(a.uid()));

        let c = pool.resolve(&req.prefer([RuntimeKind::Flash])).await.unwrap();
        let evicted = watch_destroy(&pool, &c);
        assert!(pool.evict(c.uid()));
        assert!(pool.is_empty());
        assert_eq!(*evicted.lock(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_pool() {
        let pool = pool(RuntimeConfig::default());
        let rt = pool
            .resolve(&RuntimeRequest::new(CapabilitySet::new()))
            .await
            .unwrap();

        pool.shutdown();
        assert_eq!(rt.state(), RuntimeState::Destroyed);
        assert!(pool.is_empty());

        let err = pool
            .resolve(&RuntimeRequest::new(CapabilitySet::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::PoolClosed));
    }
}
