//! Per-resource transition serializer.
//!
//! The state word decides which transition wins; this guard orders the side
//! effects (writes, listener dispatch, timer bookkeeping) of the winners. It is
//! re-entrant so a listener may call back into the resource it is observing
//! from inside its callback.

use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct Holder {
    thread: Option<ThreadId>,
    depth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Serializer {
    holder: Mutex<Holder>,
    released: Condvar,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other thread is inside a transition of this resource.
    pub fn enter(&self) -> SerialGuard<'_> {
        let me = thread::current().id();
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        while matches!(holder.thread, Some(owner) if owner != me) {
            holder = self
                .released
                .wait(holder)
                .unwrap_or_else(PoisonError::into_inner);
        }
        holder.thread = Some(me);
        holder.depth += 1;
        SerialGuard { serializer: self }
    }
}

pub(crate) struct SerialGuard<'a> {
    serializer: &'a Serializer,
}

impl Drop for SerialGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self
            .serializer
            .holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        holder.depth -= 1;
        if holder.depth == 0 {
            holder.thread = None;
            self.serializer.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_on_same_thread() {
        let serializer = Serializer::new();
        let _outer = serializer.enter();
        let _inner = serializer.enter();
    }

    #[test]
    fn excludes_other_threads() {
        let serializer = Arc::new(Serializer::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let serializer = Arc::clone(&serializer);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = serializer.enter();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
