//! In-process LRU in front of the shared store for `local_get` profiles.
//!
//! Entries expire with their profile timeout. The cache has no dependency
//! tracking of its own, so any invalidation seen by this process clears it.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;

use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::local";

#[derive(Debug)]
struct LocalEntry {
    value: Bytes,
    expires_at: Instant,
}

pub struct LocalCache {
    entries: Mutex<LruCache<String, LocalEntry>>,
}

impl LocalCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let now = Instant::now();
        let lookup = entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));
        match lookup {
            Some(Some(value)) => {
                counter!("granule_cache_hit_total", "layer" => "local").increment(1);
                Some(value)
            }
            Some(None) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, value: Bytes, ttl: Duration) {
        let entry = LocalEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        mutex_lock(&self.entries, SOURCE, "put").put(key.to_string(), entry);
    }

    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
