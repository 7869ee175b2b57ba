//! Capacity-bounded LRU session cache.
//!
//! Two indices kept in lock-step under the owner's mutex:
//!
//! - `entries`: session id → entry (session, last visit, access tick)
//! - `order`:   access tick → session id, oldest first
//!
//! "Touch on read" ([`SessionCache::get_and_touch`]) and "evict on insert
//! over capacity" ([`SessionCache::insert`]) are separate operations. The
//! capacity is passed to every insert so a reconfigured value applies
//! immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::Session;

#[derive(Debug)]
struct Entry {
    session: Arc<Session>,
    last_visit: Instant,
    tick: u64,
}

/// LRU index of live sessions. Not synchronized; wrap in a lock.
#[derive(Debug, Default)]
pub struct SessionCache {
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl SessionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no sessions are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if `id` is cached. Does not touch the entry.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Look up a session and mark it most recently used.
    pub fn get_and_touch(&mut self, id: &str, now: Instant) -> Option<Arc<Session>> {
        let tick = self.bump();
        let entry = self.entries.get_mut(id)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        entry.last_visit = now;
        self.order.insert(tick, id.to_string());
        Some(Arc::clone(&entry.session))
    }

    /// Insert a new session, then evict least recently used entries until
    /// the cache holds at most `capacity` sessions.
    ///
    /// Returns `None` without modifying the cache when `id` is already taken;
    /// otherwise the ids of evicted sessions.
    pub fn insert(
        &mut self,
        id: String,
        session: Arc<Session>,
        now: Instant,
        capacity: usize,
    ) -> Option<Vec<String>> {
        if self.entries.contains_key(&id) {
            return None;
        }
        let tick = self.bump();
        self.order.insert(tick, id.clone());
        self.entries.insert(
            id,
            Entry {
                session,
                last_visit: now,
                tick,
            },
        );

        let mut evicted = Vec::new();
        while self.entries.len() > capacity.max(1) {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        Some(evicted)
    }

    /// Remove `id` unconditionally.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Session>> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.tick);
        Some(entry.session)
    }

    /// Remove `id` only if it still maps to `session`.
    pub fn remove_if_same(&mut self, id: &str, session: &Arc<Session>) -> bool {
        let same = self
            .entries
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(&e.session, session));
        if same {
            self.remove(id);
        }
        same
    }

    /// Sessions not visited within `idle_timeout` of `now`.
    #[must_use]
    pub fn idle_since(&self, now: Instant, idle_timeout: Duration) -> Vec<(String, Arc<Session>)> {
        self.entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_visit) > idle_timeout)
            .map(|(id, e)| (id.clone(), Arc::clone(&e.session)))
            .collect()
    }

    /// Snapshot of every live session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Arc<Session>)> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(&e.session)))
            .collect()
    }

    /// Ids from least to most recently used.
    #[must_use]
    pub fn ids_by_recency(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}
