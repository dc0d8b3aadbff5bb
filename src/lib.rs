//! Parkline: suspendable push resources and topic broadcasters.
//!
//! A transport adapter (long-polling, streaming, SSE, WebSocket) wraps each
//! client connection in a [`Resource`], suspends it, and subscribes it to a
//! [`Broadcaster`]. Broadcasts, disconnects and expiry timers then race to
//! move the resource out of suspension; exactly one wins per suspend cycle,
//! and every transition is reported to the resource's listeners as an
//! [`Event`].
//!
//! # Architecture
//!
//! - **Lock-free state**: one atomic word per resource, moved by compare-and-set
//! - **Weak back-references**: events never keep a resource alive
//! - **Snapshot fan-out**: broadcasts and listener dispatch iterate copies
//! - **Observable**: `tracing` logs and OpenTelemetry counters
//!
//! # Modules
//!
//! - [`resource`]: the suspendable resource and its state machine
//! - [`event`]: transition records handed to listeners
//! - [`broadcast`]: broadcasters, the broadcaster factory, the replay cache
//! - [`listener`]: listener trait, registry and pooled delivery
//! - [`transport`]: transport kinds and the sink abstraction
//! - [`timer`]: expiry schedulers
//! - [`config`]: broadcaster and CLI configuration
//! - [`observability`]: metrics and tracing setup

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // broadcast::BroadcastOutcome is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc       // Panic docs can be verbose
)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod observability;
pub mod resource;
pub mod timer;
pub mod transport;

pub use broadcast::{BroadcastOutcome, Broadcaster, BroadcasterFactory, ReplayCache};
pub use config::{BroadcasterConfig, Config, LogFormat};
pub use error::{
    DeliveryFailure, Error, InvalidState, ListenerError, ListenerFailure, Result, TransportError,
    TransportErrorKind,
};
pub use event::{Event, EventKind};
pub use listener::{Listener, ListenerFn, ListenerId, ListenerRegistry, PooledListener};
pub use resource::{Resource, ResourceId, ResourceState};
pub use timer::{ExpiryCallback, ExpiryScheduler, ManualScheduler, TimerHandle, TokioScheduler};
pub use transport::{ChannelSink, Frame, MemorySink, Transport, TransportSink};
