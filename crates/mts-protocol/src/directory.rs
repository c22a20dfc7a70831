/// Location directory: agent identifier to current owner.
///
/// One lock per entry, never one for the whole table: holding agent A's
/// entry (e.g. while A migrates) never delays lookups or updates of agent B.
/// The map itself is sharded (`DashMap`) and only held for the instant it
/// takes to clone an entry handle out of it; no shard lock is ever held
/// across an await.
///
/// `acquire` hands out an [`EntryGuard`]: dropping it (or calling
/// [`EntryGuard::release`]) releases the entry, so the release happens on
/// every exit path, early returns and panics included.
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::AgentId;

type Slot<V> = Arc<Mutex<V>>;

/// Concurrent directory with per-entry locking.
pub struct LocationDirectory<V> {
    entries: DashMap<AgentId, Slot<V>>,
}

/// Exclusive access to one directory entry. Released on drop.
pub struct EntryGuard<V> {
    id: AgentId,
    guard: OwnedMutexGuard<V>,
}

impl<V> EntryGuard<V> {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Release the entry explicitly. Same as dropping the guard.
    pub fn release(self) {}
}

impl<V> Deref for EntryGuard<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.guard
    }
}

impl<V> DerefMut for EntryGuard<V> {
    fn deref_mut(&mut self) -> &mut V {
        &mut self.guard
    }
}

impl<V: Clone + Send + 'static> LocationDirectory<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Bind `id` to `value`, returning the previous value.
    ///
    /// A new id is inserted without taking any entry lock. An existing id
    /// waits for its own entry only, then swaps the value in place.
    pub async fn put(&self, id: AgentId, value: V) -> Option<V> {
        loop {
            let slot = match self.entries.entry(id.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(Mutex::new(value)));
                    return None;
                }
                Entry::Occupied(occupied) => occupied.get().clone(),
            };

            let mut current = slot.lock().await;
            // Removed while we were waiting: start over on a fresh slot.
            if !self.is_current(&id, &slot) {
                continue;
            }
            return Some(std::mem::replace(&mut *current, value));
        }
    }

    /// Remove `id`, waiting for any holder of its entry to release it first.
    pub async fn remove(&self, id: &AgentId) -> Option<V> {
        let slot = self.slot(id)?;
        let current = slot.lock().await;
        let removed = self
            .entries
            .remove_if(id, |_, mapped| Arc::ptr_eq(mapped, &slot))
            .is_some();
        removed.then(|| current.clone())
    }

    /// Lock the entry of `id` and return it, or `None` if `id` is unknown.
    ///
    /// Waits while another task holds the same entry. Entries of other ids
    /// are unaffected.
    pub async fn acquire(&self, id: &AgentId) -> Option<EntryGuard<V>> {
        loop {
            let slot = self.slot(id)?;
            let guard = slot.clone().lock_owned().await;
            if self.is_current(id, &slot) {
                return Some(EntryGuard {
                    id: id.clone(),
                    guard,
                });
            }
            // Entry was removed (and maybe re-added) while we waited.
        }
    }

    /// Release an entry obtained from [`acquire`](Self::acquire).
    pub fn release(&self, guard: EntryGuard<V>) {
        drop(guard);
    }

    /// Read the current value of `id` (acquire, clone, release).
    pub async fn get(&self, id: &AgentId) -> Option<V> {
        self.acquire(id).await.map(|guard| guard.clone())
    }

    /// Snapshot of the known ids. Takes no entry lock.
    pub fn keys(&self) -> Vec<AgentId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of the values, reading each entry under its own lock.
    pub async fn values(&self) -> Vec<V> {
        let slots: Vec<Slot<V>> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut values = Vec::with_capacity(slots.len());
        for slot in slots {
            values.push(slot.lock().await.clone());
        }
        values
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn slot(&self, id: &AgentId) -> Option<Slot<V>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    fn is_current(&self, id: &AgentId, slot: &Slot<V>) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), slot))
    }
}

impl<V: Clone + Send + 'static> Default for LocationDirectory<V> {
    fn default() -> Self {
        Self::new()
    }
}
