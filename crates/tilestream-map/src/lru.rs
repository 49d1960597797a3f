use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// A least-recently-used cache with a capacity and a time-to-live.
///
/// Nothing is evicted behind the caller's back: every operation that evicts returns the evicted entries, so callbacks can
/// run after all locks are released.
pub struct ExpiringLru<K, V> {
    ttl: Duration,
    /// Values paired with their expiry.
    entries: LruCache<K, (V, Instant)>,
}

impl<K, V> ExpiringLru<K, V>
where
    K: Copy + Eq + Hash,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Inserts or refreshes `key`, evicting the least recently used entry if the cache is full.
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> Vec<(K, V)> {
        // `push` hands back the old pair when `key` was already present; that is a replacement, not an eviction.
        match self.entries.push(key, (value, now + self.ttl)) {
            Some((evicted_key, (evicted, _))) if evicted_key != key => vec![(evicted_key, evicted)],
            _ => Vec::new(),
        }
    }

    /// Like [`Self::insert`], but an existing entry keeps its value, recency and expiry.
    pub fn insert_if_absent(&mut self, key: K, value: V, now: Instant) -> Vec<(K, V)> {
        if self.entries.contains(&key) {
            return Vec::new();
        }
        self.insert(key, value, now)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key).map(|(value, _)| value)
    }

    /// Removes `key` only if `matches` accepts its value.
    pub fn remove_if(&mut self, key: &K, matches: impl FnOnce(&V) -> bool) -> Option<V> {
        if !self.entries.peek(key).map_or(false, |(value, _)| matches(value)) {
            return None;
        }
        self.remove(key)
    }

    /// Evicts every entry whose time-to-live ran out before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        // Entries share one TTL, so the least recently used entry is also the first to expire.
        while let Some((_, &(_, expires_at))) = self.entries.peek_lru() {
            if expires_at > now {
                break;
            }
            match self.entries.pop_lru() {
                Some((key, (value, _))) => evicted.push((key, value)),
                None => break,
            }
        }
        evicted
    }

    /// Removes everything without treating it as an eviction.
    pub fn purge(&mut self) -> Vec<(K, V)> {
        let mut purged = Vec::with_capacity(self.entries.len());
        while let Some((key, (value, _))) = self.entries.pop_lru() {
            purged.push((key, value));
        }
        purged
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
