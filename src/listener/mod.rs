//! # Resource event listeners.
//!
//! Provides the [`Listener`] trait, the closure adapter [`ListenerFn`], the
//! per-resource [`ListenerRegistry`], and the opt-in asynchronous wrapper
//! [`PooledListener`].
//!
//! ## Dispatch
//! ```text
//! transition ──► dispatch(&event)
//!                   │  snapshot of the listener list (copy-on-write)
//!                   ├──► listener 1.on_event()  ── Err / panic ──► ListenerFailure
//!                   ├──► listener 2.on_event()
//!                   └──► listener N.on_event()
//! ```
//!
//! ## Rules
//! - Listeners run synchronously on the thread performing the transition, in
//!   registration order. A slow listener blocks that thread (and a broadcast).
//! - A failing or panicking listener never stops delivery to the rest.
//! - Adding or removing listeners from inside a callback is allowed. The pass
//!   in progress keeps its snapshot: nobody is skipped, nobody runs twice.
//! - Dispatch holds the resource's serializer. A listener on resource A that
//!   synchronously cancels (or resumes) resource B, while a listener on B does
//!   the same to A from another thread, deadlocks on the two serializers. Hand
//!   such cross-resource work to a [`PooledListener`].

mod pooled;

pub use pooled::PooledListener;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{ListenerError, ListenerFailure};
use crate::event::Event;
use crate::observability::metrics::record_listener_failure;

/// Callback invoked on every transition of a resource.
///
/// ### Implementation requirements
/// - Return quickly; the transition is not complete until every listener ran.
/// - Copy what you need out of the event. The resource keeps mutating its own
///   record for later transitions.
pub trait Listener<M>: Send + Sync + 'static {
    /// Handle one event.
    fn on_event(&self, event: &Event<M>) -> Result<(), ListenerError>;

    /// Name used in logs and in [`ListenerFailure`].
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter turning a closure into a [`Listener`].
pub struct ListenerFn<F> {
    name: String,
    f: F,
}

impl<F> ListenerFn<F> {
    pub fn new<M>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Event<M>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Build and wrap in `Arc`, ready for registration.
    pub fn arc<M>(name: impl Into<String>, f: F) -> Arc<Self>
    where
        F: Fn(&Event<M>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        Arc::new(Self::new(name, f))
    }
}

impl<M, F> Listener<M> for ListenerFn<F>
where
    F: Fn(&Event<M>) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event<M>) -> Result<(), ListenerError> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for ListenerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerFn").field("name", &self.name).finish()
    }
}

/// Handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Entry<M> {
    id: ListenerId,
    listener: Arc<dyn Listener<M>>,
}

impl<M> Clone for Entry<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: Arc::clone(&self.listener),
        }
    }
}

/// Ordered, copy-on-write listener list.
pub struct ListenerRegistry<M> {
    next_id: AtomicU64,
    entries: RwLock<Arc<[Entry<M>]>>,
}

impl<M: 'static> Default for ListenerRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: 'static> ListenerRegistry<M> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Append a listener. The same listener may be registered more than once.
    pub fn add(&self, listener: Arc<dyn Listener<M>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Entry<M>> = entries.to_vec();
        next.push(Entry { id, listener });
        *entries = Arc::from(next);
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.iter().any(|e| e.id == id) {
            return false;
        }
        let next: Vec<Entry<M>> = entries.iter().filter(|e| e.id != id).cloned().collect();
        *entries = Arc::from(next);
        true
    }

    pub fn clear(&self) {
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::from(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn snapshot(&self) -> Arc<[Entry<M>]> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Invoke every listener registered at call time, in order.
    ///
    /// Returns the failures; an empty vector means everyone succeeded.
    pub fn dispatch(&self, event: &Event<M>) -> Vec<ListenerFailure> {
        let snapshot = self.snapshot();
        let mut failures = Vec::new();

        for entry in snapshot.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.listener.on_event(event)));
            let cause = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };

            let name = entry.listener.name().to_string();
            tracing::warn!(
                listener = %name,
                event = event.kind().as_label(),
                resource = ?event.resource_id(),
                cause = %cause,
                "Listener failed"
            );
            record_listener_failure(&name);
            failures.push(ListenerFailure {
                listener: name,
                cause,
            });
        }

        failures
    }
}

impl<M: 'static> fmt::Debug for ListenerRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .snapshot()
            .iter()
            .map(|e| e.listener.name().to_string())
            .collect();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &names)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::timer::ManualScheduler;
    use crate::transport::{MemorySink, Transport};
    use crate::Resource;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn event() -> (Resource<String>, Event<String>) {
        let resource: Resource<String> = Resource::new(
            Transport::Streaming,
            Arc::new(MemorySink::<String>::new()),
            Arc::new(ManualScheduler::new()),
        );
        let event = Event::new(&resource);
        (resource, event)
    }

    fn recorder(log: &Log, name: &'static str) -> Arc<dyn Listener<String>> {
        let log = Arc::clone(log);
        ListenerFn::arc(name, move |_ev: &Event<String>| {
            log.lock().unwrap().push(name.to_string());
            Ok(())
        })
    }

    #[test]
    fn dispatches_in_registration_order() {
        let (_r, ev) = event();
        let log: Log = Arc::default();
        let registry = ListenerRegistry::<String>::new();
        registry.add(recorder(&log, "a"));
        registry.add(recorder(&log, "b"));
        registry.add(recorder(&log, "c"));

        assert!(registry.dispatch(&ev).is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn failures_do_not_stop_fan_out() {
        let (_r, ev) = event();
        let log: Log = Arc::default();
        let registry = ListenerRegistry::<String>::new();
        registry.add(ListenerFn::arc(
            "erring",
            |_ev: &Event<String>| -> Result<(), ListenerError> { Err(ListenerError::new("nope")) },
        ));
        registry.add(ListenerFn::arc("panicking", |_ev: &Event<String>| -> Result<(), ListenerError> {
            panic!("boom")
        }));
        registry.add(recorder(&log, "last"));

        let failures = registry.dispatch(&ev);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].listener, "erring");
        assert_eq!(failures[0].cause, "nope");
        assert_eq!(failures[1].listener, "panicking");
        assert_eq!(failures[1].cause, "panicked: boom");
        assert_eq!(*log.lock().unwrap(), vec!["last"]);
    }

    #[test]
    fn removal_during_dispatch_neither_skips_nor_repeats() {
        let (_r, ev) = event();
        let log: Log = Arc::default();
        let registry = Arc::new(ListenerRegistry::<String>::new());

        let self_id: Arc<Mutex<Option<ListenerId>>> = Arc::default();
        let remover = {
            let registry = Arc::clone(&registry);
            let self_id = Arc::clone(&self_id);
            let log = Arc::clone(&log);
            ListenerFn::arc("remover", move |_ev: &Event<String>| {
                log.lock().unwrap().push("remover".to_string());
                if let Some(id) = self_id.lock().unwrap().take() {
                    registry.remove(id);
                }
                Ok(())
            })
        };

        registry.add(recorder(&log, "first"));
        *self_id.lock().unwrap() = Some(registry.add(remover));
        registry.add(recorder(&log, "after"));

        registry.dispatch(&ev);
        assert_eq!(*log.lock().unwrap(), vec!["first", "remover", "after"]);

        log.lock().unwrap().clear();
        registry.dispatch(&ev);
        assert_eq!(*log.lock().unwrap(), vec!["first", "after"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn listener_added_during_dispatch_waits_for_next_pass() {
        let (_r, ev) = event();
        let log: Log = Arc::default();
        let registry = Arc::new(ListenerRegistry::<String>::new());
        let adder = {
            let registry = Arc::clone(&registry);
            let log = Arc::clone(&log);
            ListenerFn::arc("adder", move |_ev: &Event<String>| {
                if registry.len() == 1 {
                    registry.add(recorder(&log, "late"));
                }
                Ok(())
            })
        };
        registry.add(adder);

        registry.dispatch(&ev);
        assert!(log.lock().unwrap().is_empty());
        registry.dispatch(&ev);
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[test]
    fn remove_unknown_is_false() {
        let registry = ListenerRegistry::<String>::new();
        let id = registry.add(ListenerFn::arc("x", |_ev: &Event<String>| Ok(())));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn listeners_see_event_kind() {
        let (_r, ev) = event();
        let seen: Arc<Mutex<Option<EventKind>>> = Arc::default();
        let registry = ListenerRegistry::<String>::new();
        let sink = Arc::clone(&seen);
        registry.add(ListenerFn::arc("kind", move |ev: &Event<String>| {
            *sink.lock().unwrap() = Some(ev.kind());
            Ok(())
        }));
        registry.dispatch(&ev);
        assert_eq!(*seen.lock().unwrap(), Some(EventKind::Created));
    }
}
