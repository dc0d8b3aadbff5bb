//! Sink that hands JSON frames to a tokio channel.
//!
//! Used by the demo hub and handy for adapters that own the socket on a
//! separate task: the adapter drains the receiver and does the real I/O.

use std::marker::PhantomData;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::TransportSink;
use crate::error::TransportError;

/// One unit of output for the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Bytes to send.
    Data(Vec<u8>),
    /// Buffered output should go out now.
    Flush,
    /// The response is complete.
    Close,
}

/// [`TransportSink`] over an unbounded tokio channel.
#[derive(Debug)]
pub struct ChannelSink<M> {
    sender: UnboundedSender<Frame>,
    _message: PhantomData<fn(&M)>,
}

impl<M> ChannelSink<M> {
    /// Create a sink and the receiver the connection task reads from.
    pub fn new() -> (Self, UnboundedReceiver<Frame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                _message: PhantomData,
            },
            receiver,
        )
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        // send() only fails once the connection task dropped its receiver
        self.sender
            .send(frame)
            .map_err(|_| TransportError::closed())
    }
}

impl<M> TransportSink<M> for ChannelSink<M>
where
    M: Serialize,
{
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(Frame::Data(bytes.to_vec()))
    }

    fn write_object(&self, message: &M) -> Result<(), TransportError> {
        let encoded =
            serde_json::to_vec(message).map_err(|e| TransportError::encode(e.to_string()))?;
        self.send(Frame::Data(encoded))
    }

    fn flush(&self) -> Result<(), TransportError> {
        self.send(Frame::Flush)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.send(Frame::Close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use serde_json::json;

    #[test]
    fn encodes_objects_as_json() {
        let (sink, mut rx) = ChannelSink::<serde_json::Value>::new();
        sink.write_object(&json!({"seq": 1})).unwrap();
        sink.close().unwrap();

        assert_eq!(rx.try_recv().unwrap(), Frame::Data(br#"{"seq":1}"#.to_vec()));
        assert_eq!(rx.try_recv().unwrap(), Frame::Close);
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let (sink, rx) = ChannelSink::<serde_json::Value>::new();
        drop(rx);
        let err = sink.write(b"late").unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Closed);
    }
}
