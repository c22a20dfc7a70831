/// Slice location cache: last known owning node per agent.
///
/// Purely a performance hint consulted before the location directory.
/// Bounded; on overflow the entry written longest ago is evicted. Reads
/// do not refresh an entry's age. A stale entry costs one failed attempt
/// and an eviction, never a wrong delivery.
use std::num::NonZeroUsize;

use lru::LruCache;
use mts_metrics::Counter;
use parking_lot::Mutex;

use crate::types::{AgentId, ContainerId};

pub struct LocationCache {
    /// `None` when configured with capacity 0 (cache disabled).
    entries: Option<Mutex<LruCache<AgentId, ContainerId>>>,
    hits: Counter,
    misses: Counter,
}

impl LocationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
            hits: Counter::new(),
            misses: Counter::new(),
        }
    }

    pub fn get(&self, id: &AgentId) -> Option<ContainerId> {
        let found = self
            .entries
            .as_ref()
            .and_then(|entries| entries.lock().peek(id).cloned());
        match found {
            Some(_) => self.hits.inc(),
            None => self.misses.inc(),
        }
        found
    }

    pub fn put(&self, id: AgentId, node: ContainerId) {
        if let Some(entries) = &self.entries {
            entries.lock().put(id, node);
        }
    }

    pub fn remove(&self, id: &AgentId) -> Option<ContainerId> {
        self.entries
            .as_ref()
            .and_then(|entries| entries.lock().pop(id))
    }

    /// Drop every entry pointing at `node` (e.g. the node left the platform).
    pub fn remove_node(&self, node: &ContainerId) -> usize {
        let Some(entries) = &self.entries else {
            return 0;
        };
        let mut entries = entries.lock();
        let stale: Vec<AgentId> = entries
            .iter()
            .filter(|(_, n)| *n == node)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            entries.pop(id);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since creation.
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits.get(), self.misses.get())
    }
}
