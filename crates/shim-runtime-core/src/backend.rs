//! Backend plugin contract.
//!
//! A backend is one concrete implementation strategy (HTML5, Flash, ...).
//! The core never names a concrete backend: everything it needs goes through
//! the two traits defined here.
//!
//! - [`BackendFactory`]: registered once per kind; declares the descriptor
//!   and capability tests, and creates a fresh [`Backend`] per runtime.
//! - [`Backend`]: performs setup and exposes the exec table and typed
//!   components once ready.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use shim_runtime_common::{BackendError, CapabilitySet, Requirement, RuntimeKind};

use crate::capability::{BackendDescriptor, CapabilityTest};
use crate::component::ComponentSet;
use crate::event::EventTarget;
use crate::runtime::RuntimeId;

/// A backend method bound into an exec table.
pub type ExecFn = Arc<dyn Fn(&ExecContext, &[Value]) -> Result<Value, BackendError> + Send + Sync>;

/// Creates backends of one kind.
pub trait BackendFactory: Send + Sync + fmt::Debug + 'static {
    /// Kind and priority of the backends this factory creates.
    fn descriptor(&self) -> BackendDescriptor;

    /// Capability tests registered for this kind.
    fn capabilities(&self) -> Vec<(String, CapabilityTest)>;

    /// Create a backend for a new runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot even be constructed. The pool
    /// treats this like a failed initialization and falls through.
    fn create(&self, uid: &RuntimeId) -> Result<Arc<dyn Backend>, BackendError>;
}

/// A single backend instance, owned by one runtime.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug + 'static {
    /// The kind this backend implements.
    fn kind(&self) -> RuntimeKind;

    /// Perform backend-specific setup inside `container`.
    ///
    /// The runtime bounds this call with the configured init timeout.
    /// Returning `Ok` signals readiness.
    async fn initialize(
        &self,
        container: &ShimContainer,
        options: &RuntimeOptions,
    ) -> Result<(), BackendError>;

    /// Component/method table installed when the runtime becomes ready.
    fn exec_table(&self) -> ExecTable;

    /// Typed components installed when the runtime becomes ready.
    fn components(&self) -> ComponentSet {
        ComponentSet::new()
    }

    /// Release backend resources. Called at most once.
    fn destroy(&self) {}
}

/// Execution context passed to every [`ExecFn`].
///
/// Backends relay progress to the calling domain object by triggering
/// events on [`caller`](Self::caller).
#[derive(Debug, Clone)]
pub struct ExecContext {
    runtime_uid: RuntimeId,
    caller: EventTarget,
}

impl ExecContext {
    /// Create a new context.
    pub fn new(runtime_uid: RuntimeId, caller: EventTarget) -> Self {
        Self {
            runtime_uid,
            caller,
        }
    }

    /// Uid of the runtime serving the call.
    pub fn runtime_uid(&self) -> &RuntimeId {
        &self.runtime_uid
    }

    /// Event target of the domain object that made the call.
    pub fn caller(&self) -> &EventTarget {
        &self.caller
    }
}

/// `component -> method -> function` dispatch table.
#[derive(Clone, Default)]
pub struct ExecTable {
    components: HashMap<String, HashMap<String, ExecFn>>,
}

impl ExecTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a method.
    #[must_use]
    pub fn method<F>(mut self, component: &str, method: &str, f: F) -> Self
    where
        F: Fn(&ExecContext, &[Value]) -> Result<Value, BackendError> + Send + Sync + 'static,
    {
        self.insert(component, method, Arc::new(f));
        self
    }

    /// Bind an already shared method, replacing any previous binding.
    pub fn insert(&mut self, component: &str, method: &str, f: ExecFn) {
        self.components
            .entry(component.to_string())
            .or_default()
            .insert(method.to_string(), f);
    }

    /// Merge `other` into this table. Bindings in `other` win.
    #[must_use]
    pub fn merge(mut self, other: ExecTable) -> Self {
        for (component, methods) in other.components {
            self.components
                .entry(component)
                .or_default()
                .extend(methods);
        }
        self
    }

    /// Look up a method.
    pub fn get(&self, component: &str, method: &str) -> Option<&ExecFn> {
        self.components.get(component)?.get(method)
    }

    /// Returns `true` if `component.method` is bound.
    pub fn contains(&self, component: &str, method: &str) -> bool {
        self.get(component, method).is_some()
    }

    /// Apply `wrap` to every bound function.
    #[must_use]
    pub fn map<W>(self, mut wrap: W) -> Self
    where
        W: FnMut(&str, &str, ExecFn) -> ExecFn,
    {
        let components = self
            .components
            .into_iter()
            .map(|(component, methods)| {
                let methods = methods
                    .into_iter()
                    .map(|(method, f)| {
                        let wrapped = wrap(&component, &method, f);
                        (method, wrapped)
                    })
                    .collect();
                (component, methods)
            })
            .collect();
        Self { components }
    }

    /// Sorted `component -> methods` listing.
    pub fn listing(&self) -> BTreeMap<&str, Vec<&str>> {
        self.components
            .iter()
            .map(|(component, methods)| {
                let mut names: Vec<&str> = methods.keys().map(String::as_str).collect();
                names.sort_unstable();
                (component.as_str(), names)
            })
            .collect()
    }

    /// Total number of bound methods.
    pub fn len(&self) -> usize {
        self.components.values().map(HashMap::len).sum()
    }

    /// Returns `true` if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ExecTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.listing()).finish()
    }
}

/// Container a backend renders into.
///
/// Headless backends may ignore it. Visual backends record their size and
/// attach/detach it.
#[derive(Debug)]
pub struct ShimContainer {
    id: String,
    parent: Option<String>,
    size: Mutex<Option<(u32, u32)>>,
    attached: AtomicBool,
}

impl ShimContainer {
    /// Create a detached container.
    pub fn new(id: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            id: id.into(),
            parent,
            size: Mutex::new(None),
            attached: AtomicBool::new(false),
        }
    }

    /// Container id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the element the container is placed in, if one was requested.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Current size, if a backend set one.
    pub fn size(&self) -> Option<(u32, u32)> {
        *self.size.lock()
    }

    /// Record the container size.
    pub fn resize(&self, width: u32, height: u32) {
        *self.size.lock() = Some((width, height));
    }

    /// Returns `true` while the container is attached.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self) {
        self.attached.store(true, Ordering::Release);
    }

    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }
}

/// Per-runtime options.
///
/// Two requests share a runtime only when their options produce the same
/// [`ConfigKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Element id the shim container is placed in.
    pub container: Option<String>,

    /// Overrides the pool's init timeout for this runtime.
    pub init_timeout: Option<Duration>,

    /// Optional requirements the runtime was created for.
    pub preferences: Vec<Requirement>,
}

impl RuntimeOptions {
    /// Options derived from a request's capability set.
    pub fn for_capabilities(caps: &CapabilitySet) -> Self {
        Self {
            preferences: caps.optional().cloned().collect(),
            ..Self::default()
        }
    }

    /// Set the container element id.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Override the init timeout.
    #[must_use]
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }

    /// Reuse key for a runtime of `kind` created with these options.
    pub fn config_key(&self, kind: &RuntimeKind) -> ConfigKey {
        let mut preferences = self.preferences.clone();
        preferences.sort_by(|a, b| a.name.cmp(&b.name));
        ConfigKey {
            kind: kind.clone(),
            container: self.container.clone(),
            preferences,
        }
    }
}

/// Identity used to decide whether an existing runtime can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    kind: RuntimeKind,
    container: Option<String>,
    preferences: Vec<Requirement>,
}

impl ConfigKey {
    /// Kind component of the key.
    pub fn kind(&self) -> &RuntimeKind {
        &self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(ctx: &ExecContext, args: &[Value]) -> Result<Value, BackendError> {
        Ok(json!({ "runtime": ctx.runtime_uid().as_str(), "args": args }))
    }

    #[test]
    fn test_exec_table_lookup() {
        let table = ExecTable::new()
            .method("Image", "resize", echo)
            .method("Image", "getInfo", echo)
            .method("FileReader", "read", echo);

        assert_eq!(table.len(), 3);
        assert!(table.contains("Image", "resize"));
        assert!(!table.contains("Image", "crop"));
        assert!(!table.contains("Transporter", "send"));
        assert_eq!(table.listing()["Image"], vec!["getInfo", "resize"]);
    }

    #[test]
    fn test_exec_call_sees_context() {
        let table = ExecTable::new().method("Image", "resize", echo);
        let ctx = ExecContext::new(RuntimeId::from("rt_test"), EventTarget::new());

        let f = table.get("Image", "resize").unwrap();
        let out = f(&ctx, &[json!(10)]).unwrap();
        assert_eq!(out, json!({ "runtime": "rt_test", "args": [10] }));
    }

    #[test]
    fn test_merge_overrides() {
        let base = ExecTable::new().method("Image", "resize", echo);
        let other = ExecTable::new().method("Image", "resize", |_, _| Ok(json!("override")));
        let merged = base.merge(other);

        let ctx = ExecContext::new(RuntimeId::from("rt_test"), EventTarget::new());
        let out = merged.get("Image", "resize").unwrap()(&ctx, &[]).unwrap();
        assert_eq!(out, json!("override"));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_map_wraps_every_method() {
        let table = ExecTable::new()
            .method("A", "x", echo)
            .method("B", "y", echo)
            .map(|component, method, _| -> ExecFn {
                let label = format!("{component}.{method}");
                Arc::new(move |_: &ExecContext, _: &[Value]| {
                    Ok::<_, BackendError>(json!(label.clone()))
                })
            });

        let ctx = ExecContext::new(RuntimeId::from("rt_test"), EventTarget::new());
        assert_eq!(table.get("B", "y").unwrap()(&ctx, &[]).unwrap(), json!("B.y"));
    }

    #[test]
    fn test_container_lifecycle() {
        let container = ShimContainer::new("shim_rt_1", Some("drop-zone".into()));
        assert!(!container.is_attached());
        assert_eq!(container.parent(), Some("drop-zone"));

        container.attach();
        container.resize(320, 240);
        assert!(container.is_attached());
        assert_eq!(container.size(), Some((320, 240)));

        container.detach();
        assert!(!container.is_attached());
    }

    #[test]
    fn test_config_key_ignores_preference_order_and_timeout() {
        let a = RuntimeOptions::for_capabilities(
            &CapabilitySet::new()
                .prefer("display_media", true)
                .prefer("read_binary", true),
        );
        let b = RuntimeOptions::for_capabilities(
            &CapabilitySet::new()
                .prefer("read_binary", true)
                .prefer("display_media", true),
        )
        .with_init_timeout(Duration::from_secs(1));

        assert_eq!(
            a.config_key(&RuntimeKind::Html5),
            b.config_key(&RuntimeKind::Html5)
        );
        assert_ne!(
            a.config_key(&RuntimeKind::Html5),
            a.config_key(&RuntimeKind::Flash)
        );
        assert_ne!(
            a.config_key(&RuntimeKind::Html5),
            a.clone()
                .with_container("other")
                .config_key(&RuntimeKind::Html5)
        );
    }
}
