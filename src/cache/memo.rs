//! Small in-process memo with a TTL and a size cap.
//!
//! Entries older than `ttl` are treated as absent and swept on insert.
//! When the cap is hit the oldest entry goes first.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

pub struct TtlCache<K, V> {
    entries: DashMap<K, (Instant, V)>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        let (at, value) = entry.value();
        if at.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.sweep();
        while self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().0)
                .map(|e| e.key().clone());
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
        self.entries.insert(key, (Instant::now(), value));
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (at, _)| at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
