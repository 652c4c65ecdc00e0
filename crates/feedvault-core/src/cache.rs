//! Cache seam used by the fetch client.
//!
//! Production code uses the `DuckDB`-backed [`CacheStore`]; [`MemoryCache`]
//! keeps entries in a map for tests and throwaway runs.

use std::collections::HashMap;
use std::sync::Mutex;

use feedvault_store::{CacheEntry, CacheStore, StoreError};

/// Point lookups, upserts and removal of cached responses.
pub trait ResponseCache: Send + Sync {
    /// Stored entry for `key`, fresh or stale.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Insert or replace the entry under `entry.key`.
    fn put(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Remove the entry; returns whether one existed.
    fn invalidate(&self, key: &str) -> Result<bool, StoreError>;
}

impl ResponseCache for CacheStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        CacheStore::get(self, key)
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        CacheStore::put(self, entry)
    }

    fn invalidate(&self, key: &str) -> Result<bool, StoreError> {
        CacheStore::invalidate(self, key)
    }
}

/// Non-persistent cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entries = self.entries.lock().expect("memory cache mutex poisoned");
        Ok(entries.get(key).cloned())
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("memory cache mutex poisoned");
        entries.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().expect("memory cache mutex poisoned");
        Ok(entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;

    fn entry(key: &str, payload: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_owned(),
            payload: payload.to_owned(),
            fetched_at: OffsetDateTime::UNIX_EPOCH,
            ttl_seconds: 60,
            source: String::from("fred"),
            endpoint: String::from("series"),
        }
    }

    #[test]
    fn memory_cache_upserts_and_invalidates() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").expect("get").is_none());

        cache.put(&entry("k", "v1")).expect("put");
        cache.put(&entry("k", "v2")).expect("overwrite");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k").expect("get").map(|e| e.payload), Some(String::from("v2")));

        assert!(cache.invalidate("k").expect("invalidate"));
        assert!(!cache.invalidate("k").expect("second invalidate"));
        assert!(cache.is_empty());
    }

    #[test]
    fn duckdb_store_behaves_like_the_memory_cache() {
        let store = CacheStore::in_memory().expect("in-memory store");
        let cache: &dyn ResponseCache = &store;

        cache.put(&entry("k", "payload")).expect("put");
        assert_eq!(
            cache.get("k").expect("get").map(|e| e.payload),
            Some(String::from("payload"))
        );
        assert!(cache.invalidate("k").expect("invalidate"));
        assert!(cache.get("k").expect("get").is_none());
    }
}
