//! Bounded, time-windowed "already seen" filter.
//!
//! Suppresses redundant gossip only. Evicting an entry degrades to
//! forwarding again, never to dropping new data.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// LRU set of recently seen keys with a retention window.
pub struct DedupFilter<K: Hash + Eq> {
    /// Entries in first-seen order, oldest at the LRU end.
    entries: Mutex<LruCache<K, Instant>>,
    ttl: Duration,
}

impl<K: Hash + Eq> DedupFilter<K> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Record `key`. Returns `true` if it was already seen within the window.
    pub fn mark_and_check(&self, key: K) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        // peek keeps recency equal to first-seen time, so sweep can stop at
        // the first live entry.
        if let Some(seen) = entries.peek(&key) {
            if now.duration_since(*seen) < self.ttl {
                return true;
            }
        }
        entries.put(key, now);
        false
    }

    /// Whether `key` is currently held, without recording it.
    pub fn contains(&self, key: &K) -> bool {
        let entries = self.entries.lock();
        entries
            .peek(key)
            .map(|seen| seen.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Remove `key` so its next sighting counts as new.
    pub fn forget(&self, key: &K) {
        self.entries.lock().pop(key);
    }

    /// Drop expired entries. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        while let Some((_, seen)) = entries.peek_lru() {
            if seen.elapsed() < self.ttl {
                break;
            }
            entries.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
