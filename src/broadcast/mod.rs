//! # Broadcasters.
//!
//! A [`Broadcaster`] owns the subscriber set of one topic and fans messages
//! out to it. Delivery drives the per-resource transitions: every suspended
//! subscriber is resumed with the message, streaming-capable ones are parked
//! again right away.
//!
//! ```text
//! broadcast(msg)
//!   │  snapshot subscribers (read lock, released before delivery)
//!   │  per subscriber, under its serializer:
//!   ├──► suspended?  ── no ──► skipped (+ replay cache)
//!   │        │ yes
//!   │        ▼
//!   │    resource.deliver(msg) ── lost race ──► skipped
//!   │        │
//!   │        ├──► transport / listener failures ──► BroadcastOutcome.failures
//!   │        └──► streaming? ──► suspend(last timeout)
//!   └──► BroadcastOutcome { resumed, skipped, failures }
//! ```
//!
//! ## Rules
//! - A resource belongs to at most one broadcaster. A suspended resource
//!   cannot be moved; anything else is detached from its old owner first.
//! - Lock order is resource owner slot, then subscriber map. Delivery runs
//!   with no broadcaster lock held, so listeners may subscribe, unsubscribe or
//!   broadcast again.
//! - The suspended check, the cache fallback, the delivery and the streaming
//!   re-suspend of one subscriber form one step under that resource's
//!   serializer. [`Broadcaster::resuspend`] drains the cache inside the same
//!   kind of step, so cached messages always precede newer ones.
//! - After [`Broadcaster::destroy`] every subscriber is released and further
//!   subscribe / broadcast calls fail with `BroadcasterDestroyed`.

mod cache;
mod factory;

pub use cache::ReplayCache;
pub use factory::BroadcasterFactory;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use crate::config::BroadcasterConfig;
use crate::error::{DeliveryFailure, Error, InvalidState, Result};
use crate::observability::metrics::{
    record_broadcast, record_delivery, record_skipped, record_subscribers,
};
use crate::resource::{Resource, ResourceId};

/// Result of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Subscribers that received the message.
    pub resumed: usize,
    /// Subscribers that were not suspended, or lost a race to cancel/timeout.
    pub skipped: usize,
    /// Per-subscriber transport and listener failures.
    pub failures: Vec<DeliveryFailure>,
}

impl BroadcastOutcome {
    /// True when nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct BroadcasterInner<M> {
    id: String,
    config: BroadcasterConfig,
    subscribers: RwLock<HashMap<ResourceId, Resource<M>>>,
    cache: Option<ReplayCache<M>>,
    destroyed: AtomicBool,
}

/// Fan-out dispatcher for one topic.
///
/// Cheap to clone; clones share the subscriber set.
pub struct Broadcaster<M> {
    inner: Arc<BroadcasterInner<M>>,
}

impl<M> Clone for Broadcaster<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle stored in a resource's owner slot.
pub(crate) struct WeakBroadcaster<M>(Weak<BroadcasterInner<M>>);

impl<M> WeakBroadcaster<M> {
    pub(crate) fn upgrade(&self) -> Option<Broadcaster<M>> {
        self.0.upgrade().map(|inner| Broadcaster { inner })
    }

    pub(crate) fn points_to(&self, broadcaster: &Broadcaster<M>) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&broadcaster.inner))
    }
}

enum Attempt {
    Delivered,
    Failed,
    Skipped,
}

impl<M> Broadcaster<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Create a broadcaster for topic `id`.
    pub fn new(id: impl Into<String>, config: BroadcasterConfig) -> Self {
        let id = id.into();
        let cache = (config.cache_capacity > 0).then(|| ReplayCache::new(config.cache_capacity));
        tracing::info!(
            broadcaster = %id,
            cache_capacity = config.cache_capacity,
            "Broadcaster created"
        );
        Self {
            inner: Arc::new(BroadcasterInner {
                id,
                config,
                subscribers: RwLock::new(HashMap::new()),
                cache,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.inner.config
    }

    /// The replay cache, when `cache_capacity > 0`.
    pub fn cache(&self) -> Option<&ReplayCache<M>> {
        self.inner.cache.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Current subscribers, in no particular order.
    pub fn subscribers(&self) -> Vec<Resource<M>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, resource: &Resource<M>) -> bool {
        self.read().contains_key(&resource.id())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ResourceId, Resource<M>>> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ResourceId, Resource<M>>> {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn downgrade(&self) -> WeakBroadcaster<M> {
        WeakBroadcaster(Arc::downgrade(&self.inner))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::BroadcasterDestroyed(self.inner.id.clone()));
        }
        Ok(())
    }

    fn ensure_subscribed(&self, resource: &Resource<M>) -> Result<()> {
        if self.contains(resource) {
            return Ok(());
        }
        Err(Error::NotSubscribed {
            resource: resource.id(),
            broadcaster: self.inner.id.clone(),
        })
    }

    /// Add `resource` to the subscriber set.
    ///
    /// A resource owned by another broadcaster is moved here unless it is
    /// suspended there. Subscribing twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `Recycled` for a destroyed resource
    /// - `InvalidState::OwnedElsewhere` for a resource suspended on another broadcaster
    /// - `BroadcasterDestroyed` once this broadcaster is destroyed
    pub fn subscribe(&self, resource: &Resource<M>) -> Result<()> {
        self.ensure_live()?;
        let mut owner = resource.owner_slot();
        if resource.is_destroyed() {
            return Err(InvalidState::Recycled.into());
        }

        if let Some(current) = owner.as_ref().and_then(WeakBroadcaster::upgrade) {
            if current == *self {
                return Ok(());
            }
            if resource.is_suspended() {
                return Err(InvalidState::OwnedElsewhere {
                    resource: resource.id(),
                    owner: current.id().to_string(),
                }
                .into());
            }
            current.detach(resource.id());
            tracing::debug!(
                resource = %resource.id(),
                from = %current.id(),
                to = %self.inner.id,
                "Resource reassigned"
            );
        }
        *owner = None;

        {
            let mut subscribers = self.write();
            if self.is_destroyed() {
                return Err(Error::BroadcasterDestroyed(self.inner.id.clone()));
            }
            subscribers.insert(resource.id(), resource.clone());
            record_subscribers(&self.inner.id, subscribers.len());
        }
        *owner = Some(self.downgrade());

        tracing::debug!(
            broadcaster = %self.inner.id,
            resource = %resource.id(),
            transport = %resource.transport(),
            "Resource subscribed"
        );
        Ok(())
    }

    /// Remove `resource`. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, resource: &Resource<M>) -> bool {
        let mut owner = resource.owner_slot();
        let removed = self.detach(resource.id());
        if owner.as_ref().is_some_and(|w| w.points_to(self)) {
            *owner = None;
        }
        if removed {
            tracing::debug!(
                broadcaster = %self.inner.id,
                resource = %resource.id(),
                "Resource unsubscribed"
            );
        }
        removed
    }

    /// Drop `id` from the subscriber set and the cache. The caller owns the
    /// resource's owner slot.
    pub(crate) fn detach(&self, id: ResourceId) -> bool {
        let removed = {
            let mut subscribers = self.write();
            let removed = subscribers.remove(&id).is_some();
            if removed {
                record_subscribers(&self.inner.id, subscribers.len());
            }
            removed
        };
        if let Some(cache) = &self.inner.cache {
            cache.forget(id);
        }
        removed
    }

    /// Deliver `message` to every suspended subscriber.
    ///
    /// Transport and listener failures never abort the fan-out; they are
    /// returned per subscriber in [`BroadcastOutcome::failures`].
    ///
    /// # Errors
    ///
    /// `BroadcasterDestroyed` once the broadcaster is destroyed.
    pub fn broadcast(&self, message: M) -> Result<BroadcastOutcome> {
        self.ensure_live()?;
        let subscribers = self.subscribers();
        record_broadcast(&self.inner.id);

        let mut outcome = BroadcastOutcome::default();
        for resource in &subscribers {
            self.deliver_to(resource, message.clone(), &mut outcome);
        }

        tracing::debug!(
            broadcaster = %self.inner.id,
            subscribers = subscribers.len(),
            resumed = outcome.resumed,
            skipped = outcome.skipped,
            failed = outcome.failures.len(),
            "Broadcast complete"
        );
        Ok(outcome)
    }

    /// Deliver `message` to a single subscriber.
    ///
    /// # Errors
    ///
    /// `BroadcasterDestroyed`, or `NotSubscribed` when `resource` is not in
    /// this broadcaster's set.
    pub fn broadcast_to(&self, resource: &Resource<M>, message: M) -> Result<BroadcastOutcome> {
        self.ensure_live()?;
        self.ensure_subscribed(resource)?;
        record_broadcast(&self.inner.id);

        let mut outcome = BroadcastOutcome::default();
        self.deliver_to(resource, message, &mut outcome);
        Ok(outcome)
    }

    fn deliver_to(&self, resource: &Resource<M>, message: M, outcome: &mut BroadcastOutcome) {
        match self.attempt(resource, message, outcome) {
            Attempt::Delivered => {
                outcome.resumed += 1;
                record_delivery(&self.inner.id);
            }
            Attempt::Failed => {}
            Attempt::Skipped => {
                outcome.skipped += 1;
                record_skipped(&self.inner.id);
            }
        }
    }

    fn attempt(&self, resource: &Resource<M>, message: M, outcome: &mut BroadcastOutcome) -> Attempt {
        let _serial = resource.serialize();
        if !resource.is_suspended() {
            self.remember(resource, message);
            return Attempt::Skipped;
        }

        let delivery = match resource.deliver(message.clone()) {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::debug!(
                    broadcaster = %self.inner.id,
                    resource = %resource.id(),
                    error = %e,
                    "Subscriber left suspension before delivery"
                );
                self.remember(resource, message);
                return Attempt::Skipped;
            }
        };

        let written = delivery.transport.is_none();
        if let Some(failure) = delivery.into_failure(resource.id()) {
            outcome.failures.push(failure);
        }
        if !written {
            return Attempt::Failed;
        }

        if resource.transport().is_streaming() && resource.is_resuming() {
            if let Err(e) = resource.suspend(resource.suspend_timeout()) {
                tracing::debug!(resource = %resource.id(), error = %e, "Re-suspend skipped");
            }
        }
        Attempt::Delivered
    }

    fn remember(&self, resource: &Resource<M>, message: M) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        if resource.state().is_terminal() {
            return;
        }
        if cache.push(resource.id(), message) {
            tracing::debug!(
                broadcaster = %self.inner.id,
                resource = %resource.id(),
                capacity = cache.capacity(),
                "Replay cache full, oldest message dropped"
            );
        }
    }

    /// Deliver messages cached while `resource` was between polls.
    ///
    /// Long-polling subscribers get one message per call (the delivery ends
    /// the poll); streaming subscribers get everything cached. Returns how
    /// many messages were handed to the transport.
    ///
    /// # Errors
    ///
    /// `BroadcasterDestroyed` or `NotSubscribed`.
    pub fn replay(&self, resource: &Resource<M>) -> Result<usize> {
        self.ensure_live()?;
        self.ensure_subscribed(resource)?;
        let _serial = resource.serialize();
        Ok(self.drain(resource))
    }

    /// Park `resource` again and replay what it missed, in one step.
    ///
    /// A broadcast racing this call waits until the cached messages were
    /// handed over, then either reaches the re-parked resource or is cached
    /// behind them.
    ///
    /// # Errors
    ///
    /// `BroadcasterDestroyed`, `NotSubscribed`, or whatever
    /// [`Resource::suspend`] reports.
    pub fn resuspend(&self, resource: &Resource<M>, timeout: Duration) -> Result<usize> {
        self.ensure_live()?;
        self.ensure_subscribed(resource)?;
        let _serial = resource.serialize();
        resource.suspend(timeout)?;
        Ok(self.drain(resource))
    }

    fn drain(&self, resource: &Resource<M>) -> usize {
        let Some(cache) = &self.inner.cache else {
            return 0;
        };

        let id = resource.id();
        let mut replayed = 0;
        while resource.is_suspended() {
            let Some(message) = cache.pop(id) else {
                break;
            };
            let delivery = match resource.deliver(message.clone()) {
                Ok(delivery) => delivery,
                Err(_) => {
                    cache.push_front(id, message);
                    break;
                }
            };
            replayed += 1;
            record_delivery(&self.inner.id);

            if delivery.transport.is_some() || !resource.transport().is_streaming() {
                break;
            }
            if !resource.is_resuming() || resource.suspend(resource.suspend_timeout()).is_err() {
                break;
            }
        }

        if replayed > 0 {
            tracing::debug!(
                broadcaster = %self.inner.id,
                resource = %id,
                replayed,
                remaining = cache.len(id),
                "Replayed missed messages"
            );
        }
        replayed
    }

    /// Release every subscriber and refuse further work. Idempotent.
    pub fn destroy(&self) {
        let released: Vec<Resource<M>> = {
            let mut subscribers = self.write();
            if self.inner.destroyed.swap(true, Ordering::AcqRel) {
                return;
            }
            subscribers.drain().map(|(_, resource)| resource).collect()
        };

        for resource in &released {
            let mut owner = resource.owner_slot();
            if owner.as_ref().is_some_and(|w| w.points_to(self)) {
                *owner = None;
            }
        }
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
        record_subscribers(&self.inner.id, 0);

        tracing::info!(
            broadcaster = %self.inner.id,
            released = released.len(),
            "Broadcaster destroyed"
        );
    }
}

impl<M> PartialEq for Broadcaster<M> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<M> Eq for Broadcaster<M> {}

impl<M> fmt::Debug for Broadcaster<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("id", &self.inner.id)
            .field(
                "subscribers",
                &self
                    .inner
                    .subscribers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len(),
            )
            .field("destroyed", &self.inner.destroyed.load(Ordering::Acquire))
            .finish()
    }
}
