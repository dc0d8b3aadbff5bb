//! Error types for resources, broadcasters and their collaborators.
//!
//! - [`Error`]: returned by resource and broadcaster operations.
//! - [`InvalidState`]: an operation hit a resource in the wrong lifecycle state.
//! - [`TransportError`]: raised by a [`TransportSink`](crate::transport::TransportSink),
//!   attached to events instead of being thrown past a broadcaster.
//! - [`ListenerError`] / [`ListenerFailure`]: raised by listeners, collected per dispatch.
//! - [`DeliveryFailure`]: everything that went wrong delivering to one subscriber.

use thiserror::Error;

use crate::resource::{ResourceId, ResourceState};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by resource and broadcaster operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// The resource is destroyed or in a state incompatible with the operation.
    #[error(transparent)]
    InvalidState(#[from] InvalidState),

    /// The broadcaster has been destroyed and no longer accepts work.
    #[error("broadcaster '{0}' has been destroyed")]
    BroadcasterDestroyed(String),

    /// A targeted broadcast named a resource the broadcaster does not own.
    #[error("resource {resource} is not subscribed to broadcaster '{broadcaster}'")]
    NotSubscribed {
        /// The resource that was targeted.
        resource: ResourceId,
        /// Topic id of the broadcaster.
        broadcaster: String,
    },

    /// A direct write failed in the transport.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The default expiry scheduler could not find a tokio runtime.
    #[error("expiry scheduler unavailable: {0}")]
    Scheduler(String),
}

impl Error {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::InvalidState(InvalidState::Recycled) => "resource_recycled",
            Error::InvalidState(_) => "invalid_state",
            Error::BroadcasterDestroyed(_) => "broadcaster_destroyed",
            Error::NotSubscribed { .. } => "not_subscribed",
            Error::Transport(_) => "transport_failure",
            Error::Scheduler(_) => "scheduler_unavailable",
        }
    }

    /// True when the error reports a destroyed resource.
    pub fn is_recycled(&self) -> bool {
        matches!(self, Error::InvalidState(InvalidState::Recycled))
    }
}

/// An operation was attempted on a resource in an incompatible state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidState {
    /// The resource (or the event pointing at it) has been destroyed.
    #[error("Recycled")]
    Recycled,

    /// The lifecycle state does not allow the operation.
    #[error("cannot {operation} a resource that is {state}")]
    Transition {
        /// Operation that was rejected.
        operation: &'static str,
        /// State observed when the operation was attempted.
        state: ResourceState,
    },

    /// A suspended resource cannot move to another broadcaster.
    #[error("resource {resource} is suspended on broadcaster '{owner}'")]
    OwnedElsewhere {
        /// The resource being reassigned.
        resource: ResourceId,
        /// Current owner's topic id.
        owner: String,
    },
}

/// Classification of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The remote end went away.
    Closed,
    /// The payload could not be encoded.
    Encode,
    /// Any other I/O failure.
    Io,
}

/// Failure reported by a transport sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    /// Create a transport error of the given kind.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The remote end closed the connection.
    pub fn closed() -> Self {
        Self::new(TransportErrorKind::Closed, "connection closed")
    }

    /// Generic I/O failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Io, message)
    }

    /// Payload encoding failure.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Encode, message)
    }

    /// Failure classification.
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Human-readable detail.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => {
                Self::new(TransportErrorKind::Closed, err.to_string())
            }
            _ => Self::io(err.to_string()),
        }
    }
}

/// Error returned by a listener callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    /// Wrap any displayable cause.
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

/// One listener's failure during a dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("listener '{listener}' failed: {cause}")]
pub struct ListenerFailure {
    /// Name of the failing listener.
    pub listener: String,
    /// Error message or panic payload.
    pub cause: String,
}

/// Everything that went wrong delivering one message to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// The subscriber the message was meant for.
    pub resource: ResourceId,
    /// Transport failure raised while writing or flushing.
    pub transport: Option<TransportError>,
    /// Listener failures raised while dispatching the event.
    pub listeners: Vec<ListenerFailure>,
}

impl DeliveryFailure {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        if self.transport.is_some() {
            "transport_failure"
        } else {
            "listener_failure"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_displays_bare_message() {
        let err = Error::from(InvalidState::Recycled);
        assert_eq!(err.to_string(), "Recycled");
        assert!(err.is_recycled());
        assert_eq!(err.as_label(), "resource_recycled");
    }

    #[test]
    fn transition_error_names_operation_and_state() {
        let err = Error::from(InvalidState::Transition {
            operation: "resume",
            state: ResourceState::Created,
        });
        assert_eq!(err.to_string(), "cannot resume a resource that is created");
        assert_eq!(err.as_label(), "invalid_state");
    }

    #[test]
    fn io_errors_map_to_transport_kinds() {
        let closed = TransportError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(closed.kind(), TransportErrorKind::Closed);

        let other = TransportError::from(std::io::Error::other("disk on fire"));
        assert_eq!(other.kind(), TransportErrorKind::Io);
        assert_eq!(other.message(), "disk on fire");
    }

    #[test]
    fn delivery_failure_label_prefers_transport() {
        let failure = DeliveryFailure {
            resource: ResourceId::new(),
            transport: Some(TransportError::closed()),
            listeners: vec![],
        };
        assert_eq!(failure.as_label(), "transport_failure");
    }
}
