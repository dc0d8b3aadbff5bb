//! Asynchronous listener delivery.
//!
//! [`PooledListener`] wraps a listener so the transitioning thread only
//! enqueues a copy of the event:
//!
//! ```text
//! dispatch ──► PooledListener::on_event ──► [bounded queue] ──► worker task ──► inner.on_event()
//!                      │                                             └─► panic caught, logged
//!                      └─► queue full / worker gone ──► ListenerFailure for this pass
//! ```
//!
//! Per-listener FIFO is preserved; ordering relative to the resource's later
//! transitions is not. The wrapped listener sees snapshots, never the live
//! record.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::{panic_message, Listener};
use crate::error::ListenerError;
use crate::event::Event;

/// Listener that hands events to a dedicated worker task.
pub struct PooledListener<M> {
    name: String,
    sender: mpsc::Sender<Event<M>>,
}

impl<M> PooledListener<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Spawn the worker on `handle` and return the registrable wrapper.
    ///
    /// Capacity is clamped to a minimum of 1.
    pub fn spawn(listener: Arc<dyn Listener<M>>, capacity: usize, handle: &Handle) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::channel::<Event<M>>(capacity.max(1));
        let name = listener.name().to_string();

        handle.spawn(async move {
            while let Some(event) = receiver.recv().await {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(listener = listener.name(), error = %err, "Pooled listener failed");
                    }
                    Err(payload) => {
                        tracing::warn!(
                            listener = listener.name(),
                            panic = %panic_message(payload.as_ref()),
                            "Pooled listener panicked"
                        );
                    }
                }
            }
            tracing::debug!(listener = listener.name(), "Pooled listener worker stopped");
        });

        Arc::new(Self { name, sender })
    }

    /// Events queued but not yet handled.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

impl<M> Listener<M> for PooledListener<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event<M>) -> Result<(), ListenerError> {
        match self.sender.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ListenerError::new("queue full")),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ListenerError::new("worker stopped"))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
