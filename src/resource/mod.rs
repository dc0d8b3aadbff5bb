//! Suspendable resources.
//!
//! A [`Resource`] stands for one push-capable connection. Transport adapters
//! create it, [`suspend`](Resource::suspend) it while the client waits, and
//! subscribe it to a [`Broadcaster`]. From then on any thread may resume it
//! with a message, cancel it on disconnect, or let its timer expire.
//!
//! ## Lifecycle
//! ```text
//!            suspend                 broadcast / resume
//! Created ───────────► Suspended ─────────────────────────► Resumed
//!                       │  ▲  │                                │
//!                       │  └──┼────────── suspend ─────────────┘
//!              timer    │     │ disconnect
//!                       ▼     ▼
//!                  TimedOut  Cancelled        (any) ── destroy ──► Destroyed
//! ```
//!
//! ## Rules
//! - The state word is the only authority: every transition is one
//!   compare-and-set. The winner performs the side effects, losers observe
//!   `InvalidState` or a no-op.
//! - Side effects of one resource's transitions never interleave. Listeners
//!   may call back into the resource they observe.
//! - A pending expiry timer is disarmed before resume, cancel, timeout and
//!   destroy return; the timer callback is additionally gated on its suspend
//!   cycle.
//! - After `destroy()` the resource has no owner and every operation except
//!   `destroy()` and the queries fails with `Recycled`.

mod serial;
mod state;

pub use state::ResourceState;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::broadcast::{Broadcaster, WeakBroadcaster};
use crate::error::{
    DeliveryFailure, InvalidState, ListenerFailure, Result, TransportError,
};
use crate::event::{Event, EventKind, ResourceRef};
use crate::listener::{Listener, ListenerId, ListenerRegistry};
use crate::observability::metrics::{record_transition, record_transport_failure};
use crate::timer::{ExpiryScheduler, TimerHandle};
use crate::transport::{Transport, TransportSink};

use serial::Serializer;
use state::StateCell;

/// Identity of a resource, stable for its whole lifetime.
///
/// UUIDv7, so ids sort by creation time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Uuid);

impl ResourceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What happened while resuming a resource.
#[derive(Debug, Default)]
pub(crate) struct Delivery {
    pub transport: Option<TransportError>,
    pub listeners: Vec<ListenerFailure>,
}

impl Delivery {
    pub fn into_failure(self, resource: ResourceId) -> Option<DeliveryFailure> {
        if self.transport.is_none() && self.listeners.is_empty() {
            return None;
        }
        Some(DeliveryFailure {
            resource,
            transport: self.transport,
            listeners: self.listeners,
        })
    }
}

pub(crate) struct Inner<M> {
    id: ResourceId,
    transport: Transport,
    state: StateCell,
    serial: Serializer,
    event: Mutex<Event<M>>,
    owner: Mutex<Option<WeakBroadcaster<M>>>,
    sink: Arc<dyn TransportSink<M>>,
    scheduler: Arc<dyn ExpiryScheduler>,
    timer: Mutex<Option<TimerHandle>>,
    timeout: Mutex<Duration>,
    listeners: ListenerRegistry<M>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M> Inner<M> {
    /// Disarm the pending expiry timer, if any.
    fn disarm(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            self.scheduler.cancel(handle);
        }
    }
}

/// A suspendable push connection.
///
/// Cheap to clone; clones share the same state.
pub struct Resource<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for Resource<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> Resource<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Create a resource in the `Created` state.
    pub fn new(
        transport: Transport,
        sink: Arc<dyn TransportSink<M>>,
        scheduler: Arc<dyn ExpiryScheduler>,
    ) -> Self {
        let id = ResourceId::new();
        let inner = Arc::new_cyclic(|weak| Inner {
            id,
            transport,
            state: StateCell::new(),
            serial: Serializer::new(),
            event: Mutex::new(Event::attached(
                ResourceRef {
                    id,
                    inner: weak.clone(),
                },
                EventKind::Created,
            )),
            owner: Mutex::new(None),
            sink,
            scheduler,
            timer: Mutex::new(None),
            timeout: Mutex::new(Duration::ZERO),
            listeners: ListenerRegistry::new(),
        });
        tracing::trace!(resource = %id, transport = %transport, "Resource created");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<Inner<M>>) -> Self {
        Self { inner }
    }

    pub(crate) fn resource_ref(&self) -> ResourceRef<M> {
        ResourceRef {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    pub fn state(&self) -> ResourceState {
        self.inner.state.load().state
    }

    /// Whether the adapter should keep the connection parked.
    pub fn is_suspended(&self) -> bool {
        self.state() == ResourceState::Suspended
    }

    pub fn is_resuming(&self) -> bool {
        self.state() == ResourceState::Resumed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ResourceState::Cancelled
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ResourceState::Destroyed
    }

    /// Timeout passed to the last successful `suspend`.
    pub fn suspend_timeout(&self) -> Duration {
        *lock(&self.inner.timeout)
    }

    /// Copy of the resource's event record.
    pub fn current_event(&self) -> Event<M> {
        lock(&self.inner.event).clone()
    }

    /// The broadcaster this resource is subscribed to.
    pub fn broadcaster(&self) -> Option<Broadcaster<M>> {
        lock(&self.inner.owner)
            .as_ref()
            .and_then(WeakBroadcaster::upgrade)
    }

    pub(crate) fn owner_slot(&self) -> MutexGuard<'_, Option<WeakBroadcaster<M>>> {
        lock(&self.inner.owner)
    }

    /// Hold off every other thread's transitions of this resource until the
    /// guard drops. Re-entrant on the calling thread.
    pub(crate) fn serialize(&self) -> serial::SerialGuard<'_> {
        self.inner.serial.enter()
    }

    /// Register a listener for this resource's transitions.
    pub fn add_listener(&self, listener: Arc<dyn Listener<M>>) -> Result<ListenerId> {
        self.ensure_live()?;
        Ok(self.inner.listeners.add(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(InvalidState::Recycled.into());
        }
        Ok(())
    }

    fn rejected(operation: &'static str, state: ResourceState) -> crate::Error {
        match state {
            ResourceState::Destroyed => InvalidState::Recycled.into(),
            state => InvalidState::Transition { operation, state }.into(),
        }
    }

    /// Update the event record and return the snapshot listeners receive.
    fn update_event(&self, update: impl FnOnce(&mut Event<M>)) -> Event<M> {
        let mut event = lock(&self.inner.event);
        update(&mut event);
        event.clone()
    }

    fn notify(&self, event: &Event<M>) -> Vec<ListenerFailure> {
        record_transition(event.kind().as_label());
        self.inner.listeners.dispatch(event)
    }

    /// Park the resource.
    ///
    /// A non-zero `timeout` arms an expiry timer, replacing any previous one.
    /// Suspending an already suspended resource is a no-op.
    ///
    /// # Errors
    ///
    /// `Recycled` when destroyed, `InvalidState::Transition` when cancelled or
    /// timed out.
    pub fn suspend(&self, timeout: Duration) -> Result<()> {
        let _serial = self.inner.serial.enter();

        let cycle = match self.inner.state.suspend() {
            Ok(cycle) => cycle,
            Err(seen) if seen.state == ResourceState::Suspended => return Ok(()),
            Err(seen) => return Err(Self::rejected("suspend", seen.state)),
        };

        *lock(&self.inner.timeout) = timeout;
        self.inner.disarm();
        if !timeout.is_zero() {
            self.arm(cycle, timeout);
        }

        let event = self.update_event(|ev| {
            ev.set_kind(EventKind::Suspended);
            ev.set_throwable(None);
        });
        tracing::debug!(
            resource = %self.inner.id,
            cycle,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Resource suspended"
        );
        self.notify(&event);
        Ok(())
    }

    fn arm(&self, cycle: u64, timeout: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.scheduler.schedule(
            timeout,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Resource::from_inner(inner).expire(cycle);
                }
            }),
        );
        *lock(&self.inner.timer) = Some(handle);
    }

    /// Timer callback for `cycle`.
    fn expire(&self, cycle: u64) {
        let _serial = self.inner.serial.enter();
        if !self
            .inner
            .state
            .transition_in_cycle(cycle, ResourceState::TimedOut)
        {
            tracing::trace!(resource = %self.inner.id, cycle, "Stale expiry ignored");
            return;
        }
        lock(&self.inner.timer).take();
        self.finish_timeout();
    }

    /// Resume on timeout.
    ///
    /// Returns false when the resource was not suspended.
    pub fn timeout(&self) -> Result<bool> {
        let _serial = self.inner.serial.enter();
        match self
            .inner
            .state
            .transition(ResourceState::TimedOut, |s| s == ResourceState::Suspended)
        {
            Ok(_) => {
                self.inner.disarm();
                self.finish_timeout();
                Ok(true)
            }
            Err(seen) if seen.state == ResourceState::Destroyed => {
                Err(InvalidState::Recycled.into())
            }
            Err(_) => Ok(false),
        }
    }

    fn finish_timeout(&self) {
        let event = self.update_event(|ev| ev.set_kind(EventKind::TimedOut));
        tracing::debug!(resource = %self.inner.id, "Resource timed out");
        self.notify(&event);
        if let Err(e) = self.inner.sink.close() {
            tracing::debug!(resource = %self.inner.id, error = %e, "Close after timeout failed");
        }
    }

    /// Resume a suspended resource without a new message.
    ///
    /// Listeners run first, then the transport is flushed, and closed unless
    /// it is streaming-capable.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the resource is suspended. Adapters must expect
    /// this when a disconnect or a timeout won the race.
    pub fn resume(&self) -> Result<()> {
        self.resume_with(None).map(|_| ())
    }

    /// Write `message` and resume. Used by broadcasters.
    pub(crate) fn deliver(&self, message: M) -> Result<Delivery> {
        self.resume_with(Some(message))
    }

    fn resume_with(&self, message: Option<M>) -> Result<Delivery> {
        let _serial = self.inner.serial.enter();

        if let Err(seen) = self
            .inner
            .state
            .transition(ResourceState::Resumed, |s| s == ResourceState::Suspended)
        {
            return Err(Self::rejected("resume", seen.state));
        }
        self.inner.disarm();

        let mut delivery = Delivery::default();
        if let Some(message) = &message {
            if let Err(e) = self.inner.sink.write_object(message) {
                tracing::warn!(resource = %self.inner.id, error = %e, "Transport write failed");
                record_transport_failure(&e);
                delivery.transport = Some(e);
            }
        }

        let throwable = delivery.transport.clone();
        let event = self.update_event(|ev| {
            ev.set_kind(EventKind::Resumed);
            if let Some(message) = message {
                ev.set_message(message);
            }
            ev.set_throwable(throwable);
        });
        tracing::debug!(resource = %self.inner.id, "Resource resumed");
        delivery.listeners = self.notify(&event);

        let finished = if self.inner.transport.is_streaming() {
            self.inner.sink.flush()
        } else {
            self.inner
                .sink
                .flush()
                .and_then(|()| self.inner.sink.close())
        };
        if let Err(e) = finished {
            tracing::warn!(resource = %self.inner.id, error = %e, "Transport flush failed");
            record_transport_failure(&e);
            if delivery.transport.is_none() {
                let throwable = e.clone();
                self.update_event(|ev| ev.set_throwable(Some(throwable)));
                delivery.transport = Some(e);
            }
        }

        Ok(delivery)
    }

    /// Mark the resource as disconnected.
    ///
    /// Only a created or suspended resource is cancelled. Returns false when
    /// the current suspend cycle already ended in a resume, or the resource
    /// reached a terminal state; nothing is dispatched then.
    ///
    /// # Errors
    ///
    /// `Recycled` when destroyed.
    pub fn cancel(&self) -> Result<bool> {
        let _serial = self.inner.serial.enter();
        match self.inner.state.transition(ResourceState::Cancelled, |s| {
            matches!(s, ResourceState::Created | ResourceState::Suspended)
        }) {
            Ok(previous) => {
                self.inner.disarm();
                let event = self.update_event(|ev| ev.set_kind(EventKind::Cancelled));
                tracing::debug!(
                    resource = %self.inner.id,
                    from = %previous.state,
                    "Resource cancelled"
                );
                self.notify(&event);
                Ok(true)
            }
            Err(seen) if seen.state == ResourceState::Destroyed => {
                Err(InvalidState::Recycled.into())
            }
            Err(_) => Ok(false),
        }
    }

    /// Cancel and close the underlying connection.
    pub fn close(&self) -> Result<()> {
        self.cancel()?;
        self.inner.sink.close()?;
        Ok(())
    }

    /// Write raw bytes to the transport.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.inner.sink.write(bytes)?;
        Ok(())
    }

    /// Encode and write `message` through the resource's own sink.
    pub fn write_message(&self, message: &M) -> Result<()> {
        self.ensure_live()?;
        self.inner.sink.write_object(message)?;
        Ok(())
    }

    /// Write `message` to `sink` on behalf of this resource.
    pub fn write_object(&self, sink: &dyn TransportSink<M>, message: &M) -> Result<()> {
        self.ensure_live()?;
        sink.write_object(message)?;
        Ok(())
    }

    /// Recycle the resource. Idempotent.
    ///
    /// Waits for any in-flight transition of this resource, then disarms the
    /// timer, leaves the owning broadcaster and clears the event record.
    pub fn destroy(&self) {
        let _serial = self.inner.serial.enter();
        if self
            .inner
            .state
            .transition(ResourceState::Destroyed, |s| s != ResourceState::Destroyed)
            .is_err()
        {
            return;
        }

        self.inner.disarm();
        let owner = self.owner_slot().take();
        if let Some(broadcaster) = owner.as_ref().and_then(WeakBroadcaster::upgrade) {
            broadcaster.detach(self.inner.id);
        }
        lock(&self.inner.event).destroy();
        self.inner.listeners.clear();
        tracing::debug!(resource = %self.inner.id, "Resource destroyed");
    }
}

impl<M> PartialEq for Resource<M> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<M> Eq for Resource<M> {}

impl<M> Hash for Resource<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<M> fmt::Debug for Resource<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport)
            .field("state", &self.inner.state.load().state)
            .finish()
    }
}
