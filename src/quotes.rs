//! In-memory NBBO cache.
//!
//! Maps contract symbol to the latest quote. Sharded by symbol hash so the
//! farm's session readers (writers) never contend with the classifier shard
//! workers (readers) on a single lock. Entries are advisory: a miss simply
//! yields an UNKNOWN execution level downstream.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::Quote;

const SHARD_COUNT: usize = 16;

/// Soft cap per shard; least-recently-updated entries are evicted past it.
const DEFAULT_SHARD_CAP: usize = 4_096;

struct Shard {
    entries: RwLock<HashMap<String, Quote>>,
}

pub struct QuoteCache {
    shards: Vec<Shard>,
    shard_cap: usize,
    stores: AtomicU64,
    evictions: AtomicU64,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::with_shard_cap(DEFAULT_SHARD_CAP)
    }

    pub fn with_shard_cap(shard_cap: usize) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                entries: RwLock::new(HashMap::with_capacity(256)),
            })
            .collect();
        Self {
            shards,
            shard_cap: shard_cap.max(1),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_for(&self, symbol: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Overwrite the latest quote for a contract. No history is retained.
    pub fn store(&self, symbol: &str, quote: Quote) {
        let shard = self.shard_for(symbol);
        let mut entries = shard.entries.write();

        if let Some(existing) = entries.get_mut(symbol) {
            *existing = quote;
        } else {
            if entries.len() >= self.shard_cap {
                self.evict_oldest(&mut entries);
            }
            entries.insert(symbol.to_string(), quote);
        }
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookup(&self, symbol: &str) -> Option<Quote> {
        self.shard_for(symbol).entries.read().get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.entries.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Drop the least-recently-updated ~1/8 of a full shard in one sweep so
    /// eviction cost amortizes instead of firing on every store.
    fn evict_oldest(&self, entries: &mut HashMap<String, Quote>) {
        let drop_count = (self.shard_cap / 8).max(1);
        let mut stale: Vec<(String, i64)> = entries
            .iter()
            .map(|(sym, q)| (sym.clone(), q.quoted_at_ms))
            .collect();
        stale.sort_by_key(|(_, at)| *at);
        for (sym, _) in stale.into_iter().take(drop_count) {
            entries.remove(&sym);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for QuoteCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(bid: f64, ask: f64, at: i64) -> Quote {
        Quote {
            bid,
            ask,
            bid_size: 10,
            ask_size: 10,
            quoted_at_ms: at,
        }
    }

    #[test]
    fn store_then_lookup() {
        let cache = QuoteCache::new();
        assert!(cache.lookup("O:AMD251219C00155000").is_none());

        cache.store("O:AMD251219C00155000", quote(5.45, 5.50, 1));
        let q = cache.lookup("O:AMD251219C00155000").unwrap();
        assert!((q.ask - 5.50).abs() < 1e-9);
    }

    #[test]
    fn store_overwrites() {
        let cache = QuoteCache::new();
        cache.store("O:AMD251219C00155000", quote(5.45, 5.50, 1));
        cache.store("O:AMD251219C00155000", quote(5.40, 5.45, 2));
        let q = cache.lookup("O:AMD251219C00155000").unwrap();
        assert!((q.bid - 5.40).abs() < 1e-9);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_updated() {
        let cache = QuoteCache::with_shard_cap(8);
        // Overfill every shard; entries with the oldest update stamps go first.
        for i in 0..SHARD_COUNT * 16 {
            cache.store(&format!("O:T{i:04}C00100000"), quote(1.0, 1.1, i as i64));
        }
        assert!(cache.len() <= SHARD_COUNT * 8);
        assert!(cache.eviction_count() > 0);

        // The freshest write always survives its own insert.
        let last = format!("O:T{:04}C00100000", SHARD_COUNT * 16 - 1);
        assert!(cache.lookup(&last).is_some());
    }
}
