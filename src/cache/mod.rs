// src/cache/mod.rs
mod memory;

pub use memory::MemoryCache;

use std::time::Duration;

/// Narrow view of the optional external key-value cache: set-if-absent with a
/// TTL for the bid lock, plain get/set for the auction cache and replication
/// record staging. Its absence must degrade gracefully - callers log and
/// continue, they never fail the write.
pub trait CacheStore: Send + Sync {
    fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool;
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}
