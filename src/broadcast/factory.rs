//! Registry of broadcasters by topic id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::Broadcaster;
use crate::config::BroadcasterConfig;

/// Owns the broadcasters of one hub, keyed by topic id.
///
/// There is no process-wide instance; whoever builds the factory decides its
/// lifetime.
#[derive(Debug)]
pub struct BroadcasterFactory<M> {
    config: BroadcasterConfig,
    broadcasters: Mutex<HashMap<String, Broadcaster<M>>>,
}

impl<M> BroadcasterFactory<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// New broadcasters are created with `config`.
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            config,
            broadcasters: Mutex::new(HashMap::new()),
        }
    }

    fn broadcasters(&self) -> MutexGuard<'_, HashMap<String, Broadcaster<M>>> {
        self.broadcasters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the broadcaster for `id`, creating it if missing.
    ///
    /// A broadcaster destroyed behind the factory's back is replaced.
    pub fn get_or_create(&self, id: &str) -> Broadcaster<M> {
        let mut broadcasters = self.broadcasters();
        if let Some(existing) = broadcasters.get(id) {
            if !existing.is_destroyed() {
                return existing.clone();
            }
            tracing::debug!(broadcaster = id, "Replacing destroyed broadcaster");
        }
        let broadcaster = Broadcaster::new(id, self.config.clone());
        broadcasters.insert(id.to_string(), broadcaster.clone());
        broadcaster
    }

    pub fn lookup(&self, id: &str) -> Option<Broadcaster<M>> {
        self.broadcasters()
            .get(id)
            .filter(|b| !b.is_destroyed())
            .cloned()
    }

    /// Remove and destroy the broadcaster for `id`.
    pub fn remove(&self, id: &str) -> Option<Broadcaster<M>> {
        let removed = self.broadcasters().remove(id);
        if let Some(broadcaster) = &removed {
            broadcaster.destroy();
        }
        removed
    }

    /// Topic ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.broadcasters().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.broadcasters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.broadcasters().is_empty()
    }

    /// Destroy every broadcaster and empty the registry.
    pub fn destroy_all(&self) {
        let drained: Vec<Broadcaster<M>> = self.broadcasters().drain().map(|(_, b)| b).collect();
        for broadcaster in &drained {
            broadcaster.destroy();
        }
        tracing::info!(count = drained.len(), "All broadcasters destroyed");
    }
}

impl<M> Default for BroadcasterFactory<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}
