//! Transport collaborators.
//!
//! Provides:
//! - [`Transport`]: which push mechanism a resource sits on
//! - [`TransportSink`]: the write side of a connection, implemented by adapters
//! - [`MemorySink`]: records everything written, for tests and embedding
//! - [`ChannelSink`]: JSON frames over a tokio channel

mod channel;
mod memory;

pub use channel::{ChannelSink, Frame};
pub use memory::MemorySink;

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// Push mechanism underneath a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// One response per suspend; the connection closes after each resume.
    LongPolling,
    /// Chunked HTTP response kept open across messages.
    Streaming,
    /// `text/event-stream` response kept open across messages.
    ServerSentEvents,
    /// Full-duplex socket.
    WebSocket,
}

impl Transport {
    /// Whether the connection stays open after a resume, so the resource is
    /// suspended again for the next message.
    pub fn is_streaming(self) -> bool {
        !matches!(self, Transport::LongPolling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::LongPolling => "long-polling",
            Transport::Streaming => "streaming",
            Transport::ServerSentEvents => "sse",
            Transport::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long-polling" | "long-poll" | "longpoll" => Ok(Transport::LongPolling),
            "streaming" => Ok(Transport::Streaming),
            "sse" | "server-sent-events" => Ok(Transport::ServerSentEvents),
            "websocket" | "ws" => Ok(Transport::WebSocket),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Write side of one push connection.
///
/// Calls are synchronous hand-offs; an implementation may queue the bytes and
/// complete the actual I/O elsewhere.
pub trait TransportSink<M>: Send + Sync {
    /// Write raw bytes.
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Encode and write one application message.
    fn write_object(&self, message: &M) -> Result<(), TransportError>;

    /// Push buffered output to the peer.
    fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Finish the response / close the connection.
    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
