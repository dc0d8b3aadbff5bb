//! Per-resource cache of messages a subscriber missed.
//!
//! A broadcast that finds a subscriber between polls parks the message here;
//! [`Broadcaster::replay`](super::Broadcaster::replay) hands it over once the
//! client reconnects. Each queue is bounded and drops its oldest entry first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::resource::ResourceId;

/// Bounded FIFO of missed messages, one queue per resource.
#[derive(Debug)]
pub struct ReplayCache<M> {
    capacity: usize,
    entries: Mutex<HashMap<ResourceId, VecDeque<M>>>,
}

impl<M> ReplayCache<M> {
    /// Create a cache keeping at most `capacity` messages per resource.
    ///
    /// Capacity is clamped to a minimum of 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ResourceId, VecDeque<M>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue a missed message. Returns true when the oldest one was evicted.
    pub fn push(&self, resource: ResourceId, message: M) -> bool {
        let mut entries = self.entries();
        let queue = entries.entry(resource).or_default();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(message);
        evicted
    }

    /// Take the oldest missed message.
    pub fn pop(&self, resource: ResourceId) -> Option<M> {
        let mut entries = self.entries();
        let queue = entries.get_mut(&resource)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            entries.remove(&resource);
        }
        message
    }

    /// Put back a message whose replay failed, ahead of the rest.
    pub(crate) fn push_front(&self, resource: ResourceId, message: M) {
        let mut entries = self.entries();
        let queue = entries.entry(resource).or_default();
        if queue.len() >= self.capacity {
            queue.pop_back();
        }
        queue.push_front(message);
    }

    /// Drop everything cached for `resource`.
    pub fn forget(&self, resource: ResourceId) {
        self.entries().remove(&resource);
    }

    pub fn len(&self, resource: ResourceId) -> usize {
        self.entries().get(&resource).map_or(0, VecDeque::len)
    }

    /// Messages cached across all resources.
    pub fn total(&self) -> usize {
        self.entries().values().map(VecDeque::len).sum()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
