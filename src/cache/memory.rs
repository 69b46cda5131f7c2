use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::CacheStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory stand-in for the external key-value cache. Expiry is lazy:
/// a dead entry is dropped the next time its key is touched.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache::default()
    }
}

impl CacheStore for MemoryCache {
    fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            if !existing.expired() {
                return false;
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        true
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
