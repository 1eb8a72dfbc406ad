//! In-process key-value store used as the session/message cache tier.
//!
//! Exposes the string/hash/list operation surface the store layer needs,
//! with per-key TTLs. One coarse lock; entries expire lazily on access.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum KvValue {
    Str(String),
    Hash(HashMap<String, String>),
    List(Vec<String>),
}

struct KvEntry {
    value: KvValue,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

pub struct KvStore {
    inner: Mutex<HashMap<String, KvEntry>>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        KvStore { inner: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, KvEntry>> {
        self.inner.lock().expect("kv lock poisoned")
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut map = self.lock();
        match map.get(key) {
            Some(entry) if entry.live() => match &entry.value {
                KvValue::Str(s) => Some(s.clone()),
                _ => None,
            },
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.lock().insert(
            key.to_string(),
            KvEntry {
                value: KvValue::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    // ── hash operations ────────────────────────────────────────────────

    pub fn hset(&self, key: &str, field: &str, value: &str) {
        let mut map = self.lock();
        let entry = map.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: KvValue::Hash(HashMap::new()),
            expires_at: None,
        });
        if !entry.live() || !matches!(entry.value, KvValue::Hash(_)) {
            entry.value = KvValue::Hash(HashMap::new());
            entry.expires_at = None;
        }
        if let KvValue::Hash(h) = &mut entry.value {
            h.insert(field.to_string(), value.to_string());
        }
    }

    pub fn hget(&self, key: &str, field: &str) -> Option<String> {
        let map = self.lock();
        match map.get(key) {
            Some(entry) if entry.live() => match &entry.value {
                KvValue::Hash(h) => h.get(field).cloned(),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn hgetall(&self, key: &str) -> Option<HashMap<String, String>> {
        let map = self.lock();
        match map.get(key) {
            Some(entry) if entry.live() => match &entry.value {
                KvValue::Hash(h) if !h.is_empty() => Some(h.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn hdel(&self, key: &str, field: &str) {
        let mut map = self.lock();
        if let Some(entry) = map.get_mut(key) {
            if let KvValue::Hash(h) = &mut entry.value {
                h.remove(field);
            }
        }
    }

    // ── list operations ────────────────────────────────────────────────

    pub fn rpush(&self, key: &str, item: &str) {
        let mut map = self.lock();
        let entry = map.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: KvValue::List(Vec::new()),
            expires_at: None,
        });
        if !entry.live() || !matches!(entry.value, KvValue::List(_)) {
            entry.value = KvValue::List(Vec::new());
            entry.expires_at = None;
        }
        if let KvValue::List(l) = &mut entry.value {
            l.push(item.to_string());
        }
    }

    pub fn lrange(&self, key: &str) -> Option<Vec<String>> {
        let map = self.lock();
        match map.get(key) {
            Some(entry) if entry.live() => match &entry.value {
                KvValue::List(l) if !l.is_empty() => Some(l.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    // ── housekeeping ───────────────────────────────────────────────────

    /// Refresh a key's TTL (no-op for a missing key).
    pub fn expire(&self, key: &str, ttl: Duration) {
        let mut map = self.lock();
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip_and_ttl() {
        let kv = KvStore::new();
        kv.set("k", "v", None);
        assert_eq!(kv.get("k").as_deref(), Some("v"));

        kv.set("short", "lived", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(kv.get("short").is_none());
    }

    #[test]
    fn hash_operations() {
        let kv = KvStore::new();
        kv.hset("sessions:u1", "s1", "{\"name\":\"对话\"}");
        kv.hset("sessions:u1", "s2", "{\"name\":\"第二个\"}");

        assert_eq!(kv.hget("sessions:u1", "s1").as_deref(), Some("{\"name\":\"对话\"}"));
        assert_eq!(kv.hgetall("sessions:u1").unwrap().len(), 2);

        kv.hdel("sessions:u1", "s1");
        assert!(kv.hget("sessions:u1", "s1").is_none());
        assert_eq!(kv.hgetall("sessions:u1").unwrap().len(), 1);
    }

    #[test]
    fn empty_hash_reads_as_miss() {
        let kv = KvStore::new();
        kv.hset("h", "f", "v");
        kv.hdel("h", "f");
        assert!(kv.hgetall("h").is_none());
    }

    #[test]
    fn list_preserves_push_order() {
        let kv = KvStore::new();
        kv.rpush("messages:u:s", "first");
        kv.rpush("messages:u:s", "second");
        assert_eq!(
            kv.lrange("messages:u:s").unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn expire_refreshes_ttl() {
        let kv = KvStore::new();
        kv.rpush("l", "x");
        kv.expire("l", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(kv.lrange("l").is_none());

        kv.rpush("l2", "x");
        kv.expire("l2", Duration::from_secs(60));
        assert!(kv.lrange("l2").is_some());
    }

    #[test]
    fn delete_is_idempotent() {
        let kv = KvStore::new();
        kv.set("k", "v", None);
        kv.delete("k");
        kv.delete("k");
        assert!(kv.get("k").is_none());
    }
}
