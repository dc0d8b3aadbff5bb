//! In-memory sink that records every call.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::TransportSink;
use crate::error::TransportError;

/// Records writes instead of touching a socket.
///
/// Failures can be injected with [`MemorySink::fail_writes`] to exercise the
/// transport-failure paths.
#[derive(Debug)]
pub struct MemorySink<M> {
    bytes: Mutex<Vec<Vec<u8>>>,
    messages: Mutex<Vec<M>>,
    flushes: AtomicUsize,
    closes: AtomicUsize,
    failure: Mutex<Option<TransportError>>,
    closed: AtomicBool,
}

impl<M> Default for MemorySink<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MemorySink<M> {
    pub fn new() -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            failure: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with `error`.
    pub fn fail_writes(&self, error: TransportError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Raw byte writes, in order.
    pub fn bytes(&self) -> Vec<Vec<u8>> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages written through `write_object`, in order.
    pub fn messages(&self) -> Vec<M>
    where
        M: Clone,
    {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransportError> {
        match &*self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl<M> TransportSink<M> for MemorySink<M>
where
    M: Clone + Debug + Send + Sync,
{
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.check()?;
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());
        Ok(())
    }

    fn write_object(&self, message: &M) -> Result<(), TransportError> {
        self.check()?;
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), TransportError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
