//! Expiry timers for suspended resources.
//!
//! A resource suspended with a non-zero timeout arms exactly one timer through
//! an [`ExpiryScheduler`]; resume, cancel and destroy disarm it before they
//! return.
//!
//! Implementations:
//! - [`TokioScheduler`]: `tokio::time::sleep` raced against a
//!   `CancellationToken`, callback run on the blocking pool
//! - [`ManualScheduler`]: virtual clock advanced by the caller, for tests

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Callback run when a timer expires.
pub type ExpiryCallback = Box<dyn FnOnce() + Send + 'static>;

/// Opaque identifier of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Timer service consumed by resources.
pub trait ExpiryScheduler: Send + Sync {
    /// Run `callback` once after `after`, unless cancelled first.
    fn schedule(&self, after: Duration, callback: ExpiryCallback) -> TimerHandle;

    /// Disarm a timer. Unknown or already fired handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}

/// Timers backed by the tokio runtime.
pub struct TokioScheduler {
    handle: Handle,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl TokioScheduler {
    /// Schedule onto an explicit runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule onto the runtime of the calling context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scheduler`] outside of a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Scheduler(e.to_string()))
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl ExpiryScheduler for TokioScheduler {
    fn schedule(&self, after: Duration, callback: ExpiryCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());

        let pending = Arc::clone(&self.pending);
        self.handle.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                    // expiry takes the resource's transition lock, keep it off the async workers
                    if let Err(e) = tokio::task::spawn_blocking(callback).await {
                        tracing::warn!(timer = id, error = %e, "Expiry callback panicked");
                    }
                }
            }
        });

        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let token = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if let Some(token) = token {
            token.cancel();
        }
    }
}

struct ManualTimer {
    deadline: Duration,
    callback: ExpiryCallback,
}

/// Timers on a virtual clock that only moves when told to.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    now: Mutex<Duration>,
    pending: Mutex<BTreeMap<u64, ManualTimer>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Move the clock forward and fire every timer that became due, earliest
    /// deadline first. Returns how many fired.
    pub fn advance(&self, by: Duration) -> usize {
        let now = {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            *now += by;
            *now
        };

        let mut due: Vec<(Duration, u64, ExpiryCallback)> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, timer)| timer.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|t| (t.deadline, id, t.callback)))
                .collect()
        };
        due.sort_by_key(|(deadline, id, _)| (*deadline, *id));

        let fired = due.len();
        // callbacks may schedule or cancel, so the lock is released first
        for (_, _, callback) in due {
            callback();
        }
        fired
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}

impl ExpiryScheduler for ManualScheduler {
    fn schedule(&self, after: Duration, callback: ExpiryCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = self.now().saturating_add(after);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ManualTimer { deadline, callback });
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
    }
}
