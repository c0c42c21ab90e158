//! Capability registry.
//!
//! The [`CapabilityRegistry`] is the single source of truth for which backend
//! kinds satisfy which capability names. It is populated once at startup
//! through [`CapabilityRegistryBuilder`] and is read-only afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use shim_runtime_common::{CapabilitySet, CapabilityValue, RuntimeKind};

/// Static description of a backend kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// The kind this descriptor registers.
    pub kind: RuntimeKind,
    /// Selection priority; higher is tried first.
    pub priority: i32,
}

impl BackendDescriptor {
    /// Create a new descriptor.
    pub fn new(kind: RuntimeKind, priority: i32) -> Self {
        Self { kind, priority }
    }
}

type Predicate = Arc<dyn Fn(&CapabilityValue) -> bool + Send + Sync>;

/// How a backend answers a capability query.
#[derive(Clone)]
pub enum CapabilityTest {
    /// A static provided value.
    ///
    /// A boolean request is satisfied when the provided value's truthiness
    /// matches it. An integer request is satisfied by an integer limit at
    /// least as large. Anything else compares by equality.
    Value(CapabilityValue),

    /// A computed answer for the requested value.
    Predicate(Predicate),
}

impl CapabilityTest {
    /// A static provided value.
    pub fn value(value: impl Into<CapabilityValue>) -> Self {
        Self::Value(value.into())
    }

    /// A computed answer.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&CapabilityValue) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Evaluate the test against a requested value.
    pub fn evaluate(&self, requested: &CapabilityValue) -> bool {
        match self {
            Self::Predicate(f) => f(requested),
            Self::Value(provided) => match (requested, provided) {
                (CapabilityValue::Bool(want), provided) => truthy(provided) == *want,
                (CapabilityValue::Int(want), CapabilityValue::Int(limit)) => want <= limit,
                (requested, provided) => requested == provided,
            },
        }
    }
}

impl fmt::Debug for CapabilityTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

fn truthy(value: &CapabilityValue) -> bool {
    match value {
        CapabilityValue::Bool(b) => *b,
        CapabilityValue::Int(i) => *i != 0,
        CapabilityValue::Text(s) => !s.is_empty(),
    }
}

/// Lookup table from `(kind, capability)` to a [`CapabilityTest`].
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    /// Descriptors in descending priority; ties keep registration order.
    descriptors: Vec<BackendDescriptor>,
    tests: HashMap<RuntimeKind, HashMap<String, CapabilityTest>>,
}

impl CapabilityRegistry {
    /// Create a builder.
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    /// Registered descriptors in descending priority.
    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.descriptors
    }

    /// Descriptor of a single kind.
    pub fn descriptor(&self, kind: &RuntimeKind) -> Option<&BackendDescriptor> {
        self.descriptors.iter().find(|d| &d.kind == kind)
    }

    /// Returns `true` if every required capability in `set` is satisfied by
    /// `kind`.
    ///
    /// Unknown kinds and unknown capability names are unsupported.
    /// Optional entries are not evaluated.
    pub fn supports(&self, kind: &RuntimeKind, set: &CapabilitySet) -> bool {
        if self.descriptor(kind).is_none() {
            return false;
        }
        set.required()
            .all(|req| self.can(kind, &req.name, &req.value))
    }

    /// Single capability query.
    pub fn can(&self, kind: &RuntimeKind, name: &str, value: &CapabilityValue) -> bool {
        self.tests
            .get(kind)
            .and_then(|tests| tests.get(name))
            .is_some_and(|test| test.evaluate(value))
    }

    /// Names of the capabilities registered for `kind`, sorted.
    pub fn capabilities(&self, kind: &RuntimeKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .tests
            .get(kind)
            .map(|tests| tests.keys().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// Kinds satisfying `set`, in descending priority.
    pub fn matching(&self, set: &CapabilitySet) -> Vec<RuntimeKind> {
        self.descriptors
            .iter()
            .filter(|d| self.supports(&d.kind, set))
            .map(|d| d.kind.clone())
            .collect()
    }
}

/// Builder for [`CapabilityRegistry`].
#[derive(Debug, Default)]
pub struct CapabilityRegistryBuilder {
    inner: CapabilityRegistry,
}

impl CapabilityRegistryBuilder {
    /// Register (or replace) a backend descriptor.
    #[must_use]
    pub fn backend(mut self, descriptor: BackendDescriptor) -> Self {
        self.inner.descriptors.retain(|d| d.kind != descriptor.kind);
        self.inner.descriptors.push(descriptor);
        self
    }

    /// Register a capability test for a backend kind.
    #[must_use]
    pub fn register(
        mut self,
        kind: RuntimeKind,
        capability: impl Into<String>,
        test: CapabilityTest,
    ) -> Self {
        self.inner
            .tests
            .entry(kind)
            .or_default()
            .insert(capability.into(), test);
        self
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(mut self) -> CapabilityRegistry {
        // Stable sort keeps registration order among equal priorities.
        self.inner
            .descriptors
            .sort_by(|a, b| b.priority.cmp(&a.priority));
        self.inner
    }
}
