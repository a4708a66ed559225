use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::IdentityRecord;

struct CacheEntry {
    record: IdentityRecord,
    cached_at: Instant,
}

impl CacheEntry {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Cached within the TTL.
    Fresh(IdentityRecord),
    /// Cached, but older than the TTL; the caller must re-read the remote copy.
    Stale,
    Miss,
}

/// Read-through cache of identity records keyed by session token.
///
/// Entries age out after `ttl` regardless of the record's own expiry. The
/// map is sharded, so concurrent reads and inserts never block each other
/// for long and never observe a partially written entry.
pub struct SessionCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl SessionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, token: &str) -> CacheLookup {
        let lookup = match self.entries.get(token) {
            Some(entry) if entry.is_stale(self.ttl) => CacheLookup::Stale,
            Some(entry) => CacheLookup::Fresh(entry.record.clone()),
            None => CacheLookup::Miss,
        };
        let label = match &lookup {
            CacheLookup::Fresh(_) => "hit",
            CacheLookup::Stale => "stale",
            CacheLookup::Miss => "miss",
        };
        crate::observability::metrics::record_session_cache_lookup(label);
        lookup
    }

    pub fn insert(&self, token: &str, record: IdentityRecord) {
        self.evict_if_needed();
        self.entries.insert(
            token.to_string(),
            CacheEntry {
                record,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, token: &str) {
        self.entries.remove(token);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_needed(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }

        // First pass: drop everything past its TTL
        let ttl = self.ttl;
        self.entries.retain(|_, entry| !entry.is_stale(ttl));

        let current_len = self.entries.len();
        if current_len < self.max_entries {
            return;
        }

        // Still full: drop the oldest entries
        let to_evict = (current_len - self.max_entries + 1).max(self.max_entries / 10);
        let mut by_age: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.cached_at))
            .collect();
        by_age.sort_by_key(|(_, cached_at)| *cached_at);

        for (token, _) in by_age.into_iter().take(to_evict) {
            self.entries.remove(&token);
        }
    }
}
