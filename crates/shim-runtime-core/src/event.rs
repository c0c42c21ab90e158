//! Priority-ordered, cancellable publish/subscribe.
//!
//! Every asynchronous notification in the runtime core (init, init error,
//! destroy, backend progress relayed to a domain object) is delivered through
//! an [`EventTarget`].
//!
//! # Dispatch Rules
//!
//! - Handlers for one event run in descending priority; equal priorities run
//!   in registration order.
//! - [`EventTarget::trigger`] is synchronous. The handler list is snapshotted
//!   when dispatch starts, so handlers may `bind`, `unbind` or `trigger`
//!   without affecting the in-flight dispatch.
//! - A handler may call [`Event::stop_propagation`] to skip all
//!   lower-priority handlers.
//! - Once the target is destroyed nothing is dispatched, including the rest
//!   of an in-flight dispatch.
//!
//! Event names are case-insensitive.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

/// Priority used for handlers installed through event props (`onload`, ...).
pub const PROP_PRIORITY: i32 = i32::MAX;

/// A bound event handler.
pub type Handler = Arc<dyn Fn(&mut Event) + Send + Sync>;

/// Identifies a bound handler for [`EventTarget::unbind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// An event being dispatched.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    target: String,
    payload: Value,
    cancelled: bool,
}

impl Event {
    /// Normalized (lowercase) event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Uid of the target the event was triggered on.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Event payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Stop dispatch to lower-priority handlers.
    pub fn stop_propagation(&mut self) {
        self.cancelled = true;
    }

    /// Returns `true` if propagation was stopped.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Result of a [`EventTarget::trigger`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerOutcome {
    /// Number of handlers invoked.
    pub invoked: usize,
    /// Whether a handler stopped propagation.
    pub cancelled: bool,
}

#[derive(Clone)]
struct Entry {
    id: HandlerId,
    priority: i32,
    handler: Handler,
}

struct Inner {
    uid: String,
    handlers: DashMap<String, Vec<Entry>>,
    /// Converted prop names and the handler currently installed for each.
    props: DashMap<String, Option<HandlerId>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
}

/// Per-object event dispatcher.
///
/// Cloning an `EventTarget` yields another handle to the same handler
/// tables.
#[derive(Clone)]
pub struct EventTarget {
    inner: Arc<Inner>,
}

impl EventTarget {
    /// Create a target with a generated uid.
    pub fn new() -> Self {
        Self::with_uid(format!("uid_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Create a target with the given uid.
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                uid: uid.into(),
                handlers: DashMap::new(),
                props: DashMap::new(),
                next_id: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Uid of this target.
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    /// Bind a handler at priority 0.
    pub fn bind<F>(&self, name: &str, handler: F) -> HandlerId
    where
        F: Fn(&mut Event) + Send + Sync + 'static,
    {
        self.bind_with_priority(name, 0, handler)
    }

    /// Bind a handler at the given priority.
    ///
    /// Binding on a destroyed target is a no-op; the returned id is inert.
    pub fn bind_with_priority<F>(&self, name: &str, priority: i32, handler: F) -> HandlerId
    where
        F: Fn(&mut Event) + Send + Sync + 'static,
    {
        self.insert(name, priority, Arc::new(handler), Placement::Last)
    }

    fn insert(&self, name: &str, priority: i32, handler: Handler, at: Placement) -> HandlerId {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        if self.is_destroyed() {
            return id;
        }

        let mut list = self.inner.handlers.entry(normalize(name)).or_default();
        let pos = list
            .iter()
            .position(|e| match at {
                Placement::Last => e.priority < priority,
                Placement::First => e.priority <= priority,
            })
            .unwrap_or(list.len());
        list.insert(
            pos,
            Entry {
                id,
                priority,
                handler,
            },
        );
        id
    }

    /// Remove one handler. Returns `true` if it was bound.
    pub fn unbind(&self, name: &str, id: HandlerId) -> bool {
        let key = normalize(name);
        let removed = match self.inner.handlers.get_mut(&key) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|e| e.id != id);
                list.len() != before
            }
            None => false,
        };
        self.inner
            .handlers
            .remove_if(&key, |_, list| list.is_empty());
        if let Some(mut slot) = self.inner.props.get_mut(&key) {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        removed
    }

    /// Remove every handler for `name`, or every handler when `name` is `None`.
    pub fn unbind_all(&self, name: Option<&str>) {
        match name {
            Some(name) => {
                let key = normalize(name);
                self.inner.handlers.remove(&key);
                if let Some(mut slot) = self.inner.props.get_mut(&key) {
                    *slot = None;
                }
            }
            None => {
                self.inner.handlers.clear();
                for mut slot in self.inner.props.iter_mut() {
                    *slot = None;
                }
            }
        }
    }

    /// Returns `true` if at least one handler is bound for `name`.
    pub fn has_event_listener(&self, name: &str) -> bool {
        self.inner
            .handlers
            .get(&normalize(name))
            .is_some_and(|list| !list.is_empty())
    }

    /// Dispatch `name` synchronously to the bound handlers.
    pub fn trigger(&self, name: &str, payload: Value) -> TriggerOutcome {
        let mut outcome = TriggerOutcome::default();
        if self.is_destroyed() {
            return outcome;
        }

        let key = normalize(name);
        let snapshot: Vec<Entry> = match self.inner.handlers.get(&key) {
            Some(list) => list.value().clone(),
            None => return outcome,
        };

        trace!(target_uid = %self.inner.uid, event = %key, handlers = snapshot.len(), "Dispatching event");

        let mut event = Event {
            name: key,
            target: self.inner.uid.clone(),
            payload,
            cancelled: false,
        };

        for entry in snapshot {
            if self.is_destroyed() {
                break;
            }
            (entry.handler)(&mut event);
            outcome.invoked += 1;
            if event.cancelled {
                outcome.cancelled = true;
                break;
            }
        }

        outcome
    }

    /// Declare `names` as settable event props.
    ///
    /// Afterwards [`EventTarget::set_event_prop`] can install a handler for
    /// any of these events.
    pub fn convert_event_props_to_handlers<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.inner
                .props
                .entry(prop_event(name.as_ref()))
                .or_insert(None);
        }
    }

    /// Assign an event prop such as `onload`.
    ///
    /// The handler becomes the sole prop handler for the event and runs at
    /// [`PROP_PRIORITY`]. Assigning `None` clears it. Returns `false` if the
    /// prop was not converted or the target is destroyed.
    pub fn set_event_prop(&self, prop: &str, handler: Option<Handler>) -> bool {
        let key = prop_event(prop);
        let previous = match self.inner.props.get(&key) {
            Some(slot) => *slot,
            None => return false,
        };
        if self.is_destroyed() {
            return false;
        }

        if let Some(id) = previous {
            self.unbind(&key, id);
        }
        let installed = handler.map(|h| self.insert(&key, PROP_PRIORITY, h, Placement::First));
        if let Some(mut slot) = self.inner.props.get_mut(&key) {
            *slot = installed;
        }
        true
    }

    /// Returns `true` if a handler is currently assigned to the prop.
    pub fn event_prop_is_set(&self, prop: &str) -> bool {
        self.inner
            .props
            .get(&prop_event(prop))
            .is_some_and(|slot| slot.is_some())
    }

    /// Make the target inert and release all handlers.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.unbind_all(None);
        self.inner.props.clear();
        trace!(target_uid = %self.inner.uid, "Event target destroyed");
    }

    /// Returns `true` once [`EventTarget::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

// Where a handler goes among handlers of equal priority.
#[derive(Clone, Copy)]
enum Placement {
    First,
    Last,
}

impl Default for EventTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("uid", &self.inner.uid)
            .field("events", &self.inner.handlers.len())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn prop_event(prop: &str) -> String {
    let name = normalize(prop);
    match name.strip_prefix("on") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |label: &str| -> Handler {
                let log = log.clone();
                let label = label.to_string();
                Arc::new(move |_e: &mut Event| log.lock().push(label.clone()))
            }
        };
        (log, make)
    }

    #[test]
    fn test_priority_order() {
        let target = EventTarget::new();
        let (log, make) = recorder();

        let h5 = make("p5");
        let h10 = make("p10");
        let h1 = make("p1");
        target.bind_with_priority("load", 5, move |e| h5(e));
        target.bind_with_priority("load", 10, move |e| h10(e));
        target.bind_with_priority("load", 1, move |e| h1(e));

        let outcome = target.trigger("load", Value::Null);

        assert_eq!(outcome.invoked, 3);
        assert!(!outcome.cancelled);
        assert_eq!(*log.lock(), vec!["p10", "p5", "p1"]);
    }

    #[test]
    fn test_equal_priority_fifo() {
        let target = EventTarget::new();
        let (log, make) = recorder();

        for label in ["a", "b", "c"] {
            let h = make(label);
            target.bind("progress", move |e| h(e));
        }
        target.trigger("progress", Value::Null);

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stop_propagation() {
        let target = EventTarget::new();
        let (log, make) = recorder();

        let h10 = make("p10");
        let h5 = make("p5");
        let h1 = make("p1");
        target.bind_with_priority("load", 10, move |e| {
            h10(e);
            e.stop_propagation();
        });
        target.bind_with_priority("load", 5, move |e| h5(e));
        target.bind_with_priority("load", 1, move |e| h1(e));

        let outcome = target.trigger("load", Value::Null);

        assert!(outcome.cancelled);
        assert_eq!(outcome.invoked, 1);
        assert_eq!(*log.lock(), vec!["p10"]);
    }

    #[test]
    fn test_case_insensitive_names() {
        let target = EventTarget::new();
        let (log, make) = recorder();
        let h = make("resize");
        target.bind("Resize", move |e| h(e));

        target.trigger("RESIZE", Value::Null);
        assert_eq!(log.lock().len(), 1);
        assert!(target.has_event_listener("resize"));
    }

    #[test]
    fn test_payload_and_target() {
        let target = EventTarget::with_uid("uid_img");
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        target.bind("load", move |e| {
            *sink.lock() = Some((e.target().to_string(), e.payload().clone()));
        });

        target.trigger("load", json!({"width": 640}));

        let (uid, payload) = seen.lock().clone().unwrap();
        assert_eq!(uid, "uid_img");
        assert_eq!(payload["width"], 640);
    }

    #[test]
    fn test_unbind() {
        let target = EventTarget::new();
        let (log, make) = recorder();
        let ha = make("a");
        let hb = make("b");
        let id = target.bind("load", move |e| ha(e));
        target.bind("load", move |e| hb(e));

        assert!(target.unbind("load", id));
        assert!(!target.unbind("load", id));

        target.trigger("load", Value::Null);
        assert_eq!(*log.lock(), vec!["b"]);
    }

    #[test]
    fn test_unbind_all() {
        let target = EventTarget::new();
        let (log, make) = recorder();
        let ha = make("a");
        let hb = make("b");
        target.bind("load", move |e| ha(e));
        target.bind("error", move |e| hb(e));

        target.unbind_all(Some("load"));
        assert!(!target.has_event_listener("load"));
        assert!(target.has_event_listener("error"));

        target.unbind_all(None);
        assert_eq!(target.trigger("error", Value::Null).invoked, 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_snapshot_semantics() {
        let target = EventTarget::new();
        let (log, make) = recorder();

        let late = make("late");
        let late = Arc::new(Mutex::new(Some(late)));
        let second_id = Arc::new(Mutex::new(None));

        let inner_target = target.clone();
        let inner_second = second_id.clone();
        let first = make("first");
        target.bind_with_priority("load", 10, move |e| {
            first(e);
            // Binding during dispatch must not run in this dispatch.
            if let Some(h) = late.lock().take() {
                inner_target.bind("load", move |e| h(e));
            }
            // Unbinding during dispatch must not skip in this dispatch.
            if let Some(id) = *inner_second.lock() {
                inner_target.unbind("load", id);
            }
        });
        let second = make("second");
        *second_id.lock() = Some(target.bind_with_priority("load", 5, move |e| second(e)));

        target.trigger("load", Value::Null);
        assert_eq!(*log.lock(), vec!["first", "second"]);

        log.lock().clear();
        target.trigger("load", Value::Null);
        assert_eq!(*log.lock(), vec!["first", "late"]);
    }

    #[test]
    fn test_reentrant_trigger() {
        let target = EventTarget::new();
        let (log, make) = recorder();

        let inner_target = target.clone();
        let outer = make("outer");
        target.bind("load", move |e| {
            outer(e);
            inner_target.trigger("loadend", Value::Null);
        });
        let end = make("loadend");
        target.bind("loadend", move |e| end(e));

        target.trigger("load", Value::Null);
        assert_eq!(*log.lock(), vec!["outer", "loadend"]);
    }

    #[test]
    fn test_event_props() {
        let target = EventTarget::new();
        let (log, make) = recorder();
        target.convert_event_props_to_handlers(["load", "error"]);

        let regular = make("regular");
        target.bind_with_priority("load", 999, move |e| regular(e));

        assert!(target.set_event_prop("onload", Some(make("prop-1"))));
        assert!(target.set_event_prop("onload", Some(make("prop-2"))));
        assert!(target.event_prop_is_set("onload"));

        target.trigger("load", Value::Null);
        assert_eq!(*log.lock(), vec!["prop-2", "regular"]);

        assert!(target.set_event_prop("onload", None));
        assert!(!target.event_prop_is_set("onload"));
        log.lock().clear();
        target.trigger("load", Value::Null);
        assert_eq!(*log.lock(), vec!["regular"]);
    }

    #[test]
    fn test_prop_runs_before_top_priority_handlers() {
        let target = EventTarget::new();
        let (log, make) = recorder();
        target.convert_event_props_to_handlers(["load"]);

        let bound = make("bound");
        target.bind_with_priority("load", PROP_PRIORITY, move |e| bound(e));
        assert!(target.set_event_prop("onload", Some(make("prop"))));
        let later = make("later");
        target.bind_with_priority("load", PROP_PRIORITY, move |e| later(e));

        target.trigger("load", Value::Null);
        assert_eq!(*log.lock(), vec!["prop", "bound", "later"]);
    }

    #[test]
    fn test_unconverted_prop_rejected() {
        let target = EventTarget::new();
        let (_log, make) = recorder();
        assert!(!target.set_event_prop("onresize", Some(make("x"))));
        assert!(!target.has_event_listener("resize"));
    }

    #[test]
    fn test_destroyed_target_is_inert() {
        let target = EventTarget::new();
        let (log, make) = recorder();
        let h = make("a");
        target.bind("load", move |e| h(e));

        target.destroy();
        target.unbind_all(None);
        let late = make("late");
        target.bind("load", move |e| late(e));

        assert_eq!(target.trigger("load", Value::Null).invoked, 0);
        assert!(!target.has_event_listener("load"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_destroy_during_dispatch_stops() {
        let target = EventTarget::new();
        let (log, make) = recorder();

        let inner_target = target.clone();
        let first = make("first");
        target.bind_with_priority("load", 10, move |e| {
            first(e);
            inner_target.destroy();
        });
        let second = make("second");
        target.bind_with_priority("load", 5, move |e| second(e));

        let outcome = target.trigger("load", Value::Null);
        assert_eq!(outcome.invoked, 1);
        assert_eq!(*log.lock(), vec!["first"]);
    }
}
