//! Typed component lookup.
//!
//! Besides the string-keyed exec table, a backend may expose components as
//! trait objects. Domain code asks for them by type, e.g.
//! `runtime.component::<dyn ImageComponent>()`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A set of components keyed by their (possibly unsized) type.
#[derive(Default)]
pub struct ComponentSet {
    components: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    names: Vec<&'static str>,
}

impl ComponentSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a component, replacing any previous one of the same type.
    pub fn insert<T>(&mut self, component: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let previous = self
            .components
            .insert(TypeId::of::<T>(), Box::new(component));
        if previous.is_none() {
            self.names.push(type_label::<T>());
        }
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with<T>(mut self, component: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.insert(component);
        self
    }

    /// Look up a component by type.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.components
            .get(&TypeId::of::<T>())
            .and_then(|c| c.downcast_ref::<Arc<T>>())
            .cloned()
    }

    /// Returns `true` if a component of type `T` is present.
    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + 'static,
    {
        self.components.contains_key(&TypeId::of::<T>())
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl fmt::Debug for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(&self.names).finish()
    }
}

/// Short display name of a component type, used in error messages.
///
/// `dyn my_crate::image::ImageComponent` becomes `ImageComponent`.
pub(crate) fn type_label<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
