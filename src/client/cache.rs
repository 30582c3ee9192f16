use super::ClientInfo;
use axum::http::HeaderMap;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

const RELEVANT_HEADERS: &[&str] = &[
    "user-agent",
    "accept",
    "sec-ch-ua",
    "sec-ch-ua-platform",
    "viewport-width",
    "sec-ch-viewport-width",
    "dpr",
    "sec-ch-dpr",
    "save-data",
    "ect",
    "rtt",
    "downlink",
    "device-memory",
    "hardware-concurrency",
];

/// Hash over the headers the detector actually reads, used as the LRU
/// key (spec.md §4.5 "an in-process LRU keyed by a hash over the
/// relevant headers").
pub fn hash_headers(headers: &HeaderMap) -> u64 {
    let mut hasher = Sha256::new();
    for name in RELEVANT_HEADERS {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        if let Some(v) = headers.get(*name) {
            hasher.update(v.as_bytes());
        }
        hasher.update([0xff]);
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

struct Entry {
    value: ClientInfo,
    inserted_at: Instant,
}

/// Process-local LRU cache for detector results, TTL-bounded and pruned
/// to 75% of capacity (oldest-by-timestamp first) on overflow, per
/// spec.md §4.5 and §5.
pub struct DetectorCache {
    inner: Mutex<LruCache<u64, Entry>>,
    ttl: Duration,
    max_size: usize,
}

impl DetectorCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
            max_size,
        }
    }

    pub fn get(&self, key: &u64) -> Option<ClientInfo> {
        let mut guard = self.inner.lock();
        match guard.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                guard.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: u64, value: ClientInfo) {
        let mut guard = self.inner.lock();
        guard.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        if guard.len() > self.max_size {
            prune_to(&mut guard, self.max_size * 3 / 4);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Drop oldest-by-insertion entries until at or below `target`. The
/// `lru` crate's own ordering is recency-of-access, so we also sort by
/// `inserted_at` explicitly to honor "oldest first by timestamp" even
/// when a stale entry was recently re-read.
fn prune_to(cache: &mut LruCache<u64, Entry>, target: usize) {
    let mut keys: Vec<(u64, Instant)> = cache.iter().map(|(k, v)| (*k, v.inserted_at)).collect();
    keys.sort_by_key(|(_, ts)| *ts);
    let overflow = cache.len().saturating_sub(target);
    for (k, _) in keys.into_iter().take(overflow) {
        cache.pop(&k);
    }
}
