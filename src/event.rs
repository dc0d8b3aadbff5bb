//! Resource events.
//!
//! An [`Event`] describes the latest transition of one resource together with
//! the message and failure that came with it. Each resource owns one mutable
//! event record and hands listeners a snapshot of it per transition.
//!
//! ## Rules
//! - `is_cancelled()` and `is_resumed_on_timeout()` are projections of a single
//!   [`EventKind`], so they can never both be true.
//! - A cancelled event never carries a message.
//! - The back-reference to the resource is weak. Once the event is destroyed,
//!   every accessor that needs the resource fails with `Recycled`.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use parkline::{Event, EventKind, ManualScheduler, MemorySink, Resource, Transport};
//!
//! let resource: Resource<String> = Resource::new(
//!     Transport::LongPolling,
//!     Arc::new(MemorySink::<String>::new()),
//!     Arc::new(ManualScheduler::new()),
//! );
//!
//! let ev = Event::cancelled(&resource);
//! assert_eq!(ev.kind(), EventKind::Cancelled);
//! assert!(ev.is_cancelled());
//! assert!(!ev.is_resumed_on_timeout());
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Weak;

use crate::broadcast::Broadcaster;
use crate::error::{InvalidState, Result, TransportError};
use crate::resource::{Inner, Resource, ResourceId};
use crate::transport::TransportSink;

/// Transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// No transition yet.
    Created,
    /// The resource was parked.
    Suspended,
    /// The resource was resumed, usually with a broadcast message.
    Resumed,
    /// The remote end disconnected.
    Cancelled,
    /// The expiry timer fired while suspended.
    TimedOut,
}

impl EventKind {
    pub fn as_label(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Suspended => "suspended",
            EventKind::Resumed => "resumed",
            EventKind::Cancelled => "cancelled",
            EventKind::TimedOut => "timed_out",
        }
    }
}

/// Weak handle from an event to its resource.
pub(crate) struct ResourceRef<M> {
    pub(crate) id: ResourceId,
    pub(crate) inner: Weak<Inner<M>>,
}

impl<M> Clone for ResourceRef<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Weak::clone(&self.inner),
        }
    }
}

/// Notification describing one resource transition.
pub struct Event<M> {
    kind: EventKind,
    message: Option<M>,
    throwable: Option<TransportError>,
    resource: Option<ResourceRef<M>>,
}

impl<M> Clone for Event<M>
where
    M: Clone,
{
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            throwable: self.throwable.clone(),
            resource: self.resource.clone(),
        }
    }
}

impl<M> Event<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// A fresh event for `resource`, before any transition.
    pub fn new(resource: &Resource<M>) -> Self {
        Self::attached(resource.resource_ref(), EventKind::Created)
    }

    /// An event describing a disconnect of `resource`.
    pub fn cancelled(resource: &Resource<M>) -> Self {
        Self::attached(resource.resource_ref(), EventKind::Cancelled)
    }

    /// An event describing an expiry of `resource`.
    pub fn timed_out(resource: &Resource<M>) -> Self {
        Self::attached(resource.resource_ref(), EventKind::TimedOut)
    }

    /// The resource this event belongs to.
    ///
    /// # Errors
    ///
    /// `Recycled` once the event or the resource is gone.
    pub fn resource(&self) -> Result<Resource<M>> {
        self.resource
            .as_ref()
            .and_then(|r| r.inner.upgrade())
            .map(Resource::from_inner)
            .ok_or_else(|| InvalidState::Recycled.into())
    }

    /// Whether the resource is currently suspended. False once recycled.
    pub fn is_suspended(&self) -> bool {
        self.resource().map(|r| r.is_suspended()).unwrap_or(false)
    }

    /// Whether the resource is currently resumed.
    pub fn is_resuming(&self) -> Result<bool> {
        Ok(self.resource()?.is_resuming())
    }

    /// The broadcaster currently owning the resource.
    pub fn broadcaster(&self) -> Result<Option<Broadcaster<M>>> {
        Ok(self.resource()?.broadcaster())
    }

    /// Write raw bytes to the resource's transport.
    pub fn write(&self, bytes: &[u8]) -> Result<&Self> {
        self.resource()?.write(bytes)?;
        Ok(self)
    }

    /// Write `message` to `sink` on behalf of the resource.
    pub fn write_object(&self, sink: &dyn TransportSink<M>, message: &M) -> Result<&Self> {
        self.resource()?.write_object(sink, message)?;
        Ok(self)
    }
}

impl<M> Event<M> {
    pub(crate) fn attached(resource: ResourceRef<M>, kind: EventKind) -> Self {
        Self {
            kind,
            message: None,
            throwable: None,
            resource: Some(resource),
        }
    }

    /// Attach a failure cause.
    #[must_use]
    pub fn with_throwable(mut self, throwable: TransportError) -> Self {
        self.throwable = Some(throwable);
        self
    }

    /// Attach a message. Ignored on cancelled events.
    #[must_use]
    pub fn with_message(mut self, message: M) -> Self {
        if self.kind != EventKind::Cancelled {
            self.message = Some(message);
        }
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The last broadcast message, `None` before the first one.
    pub fn message(&self) -> Option<&M> {
        self.message.as_ref()
    }

    pub fn throwable(&self) -> Option<&TransportError> {
        self.throwable.as_ref()
    }

    /// Was the remote connection closed.
    pub fn is_cancelled(&self) -> bool {
        self.kind == EventKind::Cancelled
    }

    /// Was the resource resumed by its expiry timer.
    pub fn is_resumed_on_timeout(&self) -> bool {
        self.kind == EventKind::TimedOut
    }

    /// Id of the resource, `None` once destroyed.
    pub fn resource_id(&self) -> Option<ResourceId> {
        self.resource.as_ref().map(|r| r.id)
    }

    pub fn is_destroyed(&self) -> bool {
        self.resource.is_none()
    }

    /// Drop the resource back-reference and the message.
    pub fn destroy(&mut self) -> &mut Self {
        self.resource = None;
        self.message = None;
        self
    }

    pub(crate) fn set_kind(&mut self, kind: EventKind) {
        self.kind = kind;
        if kind == EventKind::Cancelled {
            self.message = None;
        }
    }

    pub(crate) fn set_message(&mut self, message: M) {
        self.message = Some(message);
    }

    pub(crate) fn set_throwable(&mut self, throwable: Option<TransportError>) {
        self.throwable = throwable;
    }
}

impl<M: PartialEq> PartialEq for Event<M> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && self.throwable == other.throwable
            && self.resource_id() == other.resource_id()
    }
}

impl<M: Eq> Eq for Event<M> {}

impl<M: Hash> Hash for Event<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.message.hash(state);
        self.throwable.hash(state);
        self.resource_id().hash(state);
    }
}

impl<M: fmt::Debug> fmt::Debug for Event<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("cancelled", &self.is_cancelled())
            .field("resumed_on_timeout", &self.is_resumed_on_timeout())
            .field("throwable", &self.throwable)
            .field("message", &self.message)
            .field("resource", &self.resource_id())
            .finish()
    }
}
