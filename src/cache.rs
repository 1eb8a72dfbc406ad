//! In-process cache: bounded LRU with per-entry TTL and a stats view.
//!
//! One coarse lock guards the whole map; entries are evicted
//! least-recently-used when capacity is reached and lazily dropped when
//! expired. `cached_call` wraps an async producer so that a hit bypasses
//! the call entirely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::AppError;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
    last_used: Instant,
}

struct Inner<V> {
    map: HashMap<String, Entry<V>>,
    stats: CacheStats,
}

pub struct LruTtlCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<V: Clone> LruTtlCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        LruTtlCache {
            inner: Mutex::new(Inner { map: HashMap::new(), stats: CacheStats::default() }),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();

        let hit = match inner.map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = now;
                Some(entry.value.clone())
            }
            _ => None,
        };

        match hit {
            Some(value) => {
                inner.stats.hits += 1;
                Some(value)
            }
            None => {
                // Drop an expired entry eagerly so size() stays honest.
                inner.map.remove(key);
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();

        if inner.map.len() >= self.capacity && !inner.map.contains_key(key) {
            if let Some(lru_key) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&lru_key);
                inner.stats.evictions += 1;
                tracing::debug!("cache: evicted (lru) {}", lru_key);
            }
        }

        let ttl = ttl.unwrap_or(self.default_ttl);
        inner.map.insert(
            key.to_string(),
            Entry { value, expires_at: now + ttl, last_used: now },
        );
        inner.stats.sets += 1;
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.map.remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let count = inner.map.len();
        inner.map.clear();
        tracing::info!("cache: cleared {} entries", count);
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").map.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().expect("cache lock poisoned").stats.clone()
    }
}

/// Derive a cache key from a prefix, an operation name and the
/// JSON-serialized arguments: `"{prefix}:{op}:{hex(sha256(args))}"`.
pub fn cache_key(prefix: &str, op: &str, args: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{}:{}:{:x}", prefix, op, digest)
}

/// Run `producer` through the cache: a fresh entry is returned without
/// invoking it at all; a miss invokes it and stores the result.
pub async fn cached_call<V, F, Fut>(
    cache: &LruTtlCache<V>,
    key: &str,
    ttl: Option<Duration>,
    producer: F,
) -> Result<V, AppError>
where
    V: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, AppError>>,
{
    if let Some(hit) = cache.get(key) {
        return Ok(hit);
    }
    let value = producer().await?;
    cache.set(key, value.clone(), ttl);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_roundtrip() {
        let cache: LruTtlCache<String> = LruTtlCache::new(10, Duration::from_secs(60));
        assert!(cache.get("k").is_none());
        cache.set("k", "v".into(), None);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn ttl_expiry() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(10, Duration::from_secs(60));
        cache.set("k", 1, Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(2, Duration::from_secs(60));
        cache.set("a", 1, None);
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b", 2, None);
        std::thread::sleep(Duration::from_millis(2));
        // Touch "a" so "b" becomes the least recently used.
        assert_eq!(cache.get("a"), Some(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.set("c", 3, None);

        assert_eq!(cache.get("a"), Some(1));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(4, Duration::from_secs(60));
        cache.get("missing");
        cache.set("k", 1, None);
        cache.get("k");
        cache.get("k");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn key_is_stable_and_arg_sensitive() {
        let a1 = cache_key("embed", "batch", &serde_json::json!(["文本一"]));
        let a2 = cache_key("embed", "batch", &serde_json::json!(["文本一"]));
        let b = cache_key("embed", "batch", &serde_json::json!(["文本二"]));
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.starts_with("embed:batch:"));
    }

    #[tokio::test]
    async fn cached_call_bypasses_producer_on_hit() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(4, Duration::from_secs(60));
        let mut calls = 0;

        for _ in 0..3 {
            let value = cached_call(&cache, "k", None, || {
                calls += 1;
                async { Ok::<i32, AppError>(42) }
            })
            .await
            .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls, 1);
    }
}
