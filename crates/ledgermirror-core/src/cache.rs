//! Injected TTL caches.
//!
//! Components that want caching take an `Arc<dyn Cache<V>>` at construction
//! instead of reaching for process-wide state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub trait Cache<V>: Send + Sync {
    /// Value for `key` if present and not expired.
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V, ttl: Duration);

    fn invalidate(&self, key: &str);
}

/// In-process cache with per-entry expiry.
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, (V, Instant)>>,
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> MemoryCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (V, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send> Cache<V> for MemoryCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        self.entries()
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }

    fn invalidate(&self, key: &str) {
        self.entries().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_before_and_after_expiry() {
        let cache: MemoryCache<u64> = MemoryCache::new();
        cache.set("a", 1, Duration::from_secs(60));
        cache.set("b", 2, Duration::ZERO);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn invalidate_and_purge() {
        let cache: MemoryCache<String> = MemoryCache::new();
        cache.set("a", "x".into(), Duration::from_secs(60));
        cache.set("b", "y".into(), Duration::ZERO);
        assert_eq!(cache.purge_expired(), 1);
        cache.invalidate("a");
        assert!(cache.is_empty());
    }
}
