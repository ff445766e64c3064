//! Process-local TTL cache with wildcard invalidation.
//!
//! Values are stored as `serde_json::Value` so one instance can memoize
//! differently typed reads (resource metadata, per-account unlock lists)
//! and a single `invalidate_pattern("account:42:*")` clears all of them.
//!
//! Expiry is lazy on `get` and proactive through a background sweep, so
//! `len()` and pattern invalidation are not skewed by stale entries.
//! Not shared across processes; lost on restart.

use dashmap::DashMap;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct CacheManager {
    entries: Arc<DashMap<String, CacheEntry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Cache without a background sweep (expired entries still vanish on read).
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Cache with a sweep task running every `sweep_interval`.
    /// Must be called inside a tokio runtime.
    pub fn start(default_ttl: Duration, sweep_interval: Duration) -> Self {
        let cache = Self::new(default_ttl);
        let entries = Arc::clone(&cache.entries);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = sweep_expired(&entries, Instant::now());
                if removed > 0 {
                    debug!("[cache] swept {removed} expired entries");
                }
            }
        });
        if let Ok(mut slot) = cache.sweeper.lock() {
            *slot = Some(handle);
        }
        cache
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Raw JSON lookup. Expired entries are removed and reported absent.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                debug!("[cache] entry {key} has unexpected shape: {err}");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(value) => self.set_value(key, value, ttl),
            Err(err) => warn!("[cache] not caching {key}: {err}"),
        }
    }

    pub fn set_value(&self, key: &str, value: Value, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Delete every key matching `pattern` (`*` matches any sequence).
    /// Returns the number of removed entries.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| wildcard_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        doomed
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count()
    }

    /// Read-through helper: return the cached value or compute, store with
    /// the default TTL, and return it. Errors are not cached.
    pub async fn get_or_try_insert_with<T, E, F, Fut>(&self, key: &str, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(key) {
            return Ok(hit);
        }
        let value = load().await?;
        self.set(key, &value, self.default_ttl);
        Ok(value)
    }

    /// Entry count, including entries not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// Stop the background sweep. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_expired(entries: &DashMap<String, CacheEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before.saturating_sub(entries.len())
}

/// Glob match where `*` matches any (possibly empty) sequence and every
/// other character matches itself.
pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.as_bytes();
    let candidate = candidate.as_bytes();
    let (mut p, mut c) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while c < candidate.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            p += 1;
            resume = c;
        } else if p < pattern.len() && pattern[p] == candidate[c] {
            p += 1;
            c += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            resume += 1;
            c = resume;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Lead {
        id: String,
        title: String,
    }

    #[tokio::test(start_paused = true)]
    async fn value_lives_exactly_as_long_as_its_ttl() {
        let cache = CacheManager::new(Duration::from_secs(60));
        cache.set("k", &"v", Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(cache.get::<String>("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cache.get::<String>("k"), None);
        // Lazy expiry removed the entry.
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_entries_nobody_reads() {
        let cache = CacheManager::start(Duration::from_secs(60), Duration::from_millis(200));
        cache.set("short", &1, Duration::from_millis(100));
        cache.set("long", &2, Duration::from_secs(10));
        assert_eq!(cache.len(), 2);

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<i32>("long"), Some(2));
        cache.shutdown();
    }

    #[tokio::test]
    async fn typed_round_trip_and_shape_mismatch() {
        let cache = CacheManager::new(Duration::from_secs(60));
        let lead = Lead {
            id: "lead-1".into(),
            title: "Steel coils".into(),
        };
        cache.set("resource:lead-1", &lead, cache.default_ttl());
        assert_eq!(cache.get::<Lead>("resource:lead-1"), Some(lead));
        assert_eq!(cache.get::<u64>("resource:lead-1"), None);
    }

    #[tokio::test]
    async fn invalidate_pattern_clears_one_account_only() {
        let cache = CacheManager::new(Duration::from_secs(60));
        let ttl = Duration::from_secs(60);
        cache.set("account:42:unlocks", &vec!["a"], ttl);
        cache.set("account:42:balance", &7, ttl);
        cache.set("account:420:unlocks", &vec!["b"], ttl);
        cache.set("resource:a", &"lead", ttl);

        assert_eq!(cache.invalidate_pattern("account:42:*"), 2);
        assert!(cache.get_value("account:42:unlocks").is_none());
        assert!(cache.get_value("account:420:unlocks").is_some());
        assert!(cache.get_value("resource:a").is_some());
    }

    #[tokio::test]
    async fn delete_and_stats() {
        let cache = CacheManager::new(Duration::from_secs(60));
        cache.set("k", &1, Duration::from_secs(1));
        assert_eq!(cache.get::<i32>("k"), Some(1));
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert_eq!(cache.get::<i32>("k"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn read_through_caches_success_but_not_errors() {
        let cache = CacheManager::new(Duration::from_secs(60));
        let failed: Result<u32, &str> = cache
            .get_or_try_insert_with("n", || async { Err("down") })
            .await;
        assert_eq!(failed, Err("down"));
        assert!(cache.is_empty());

        let first: Result<u32, &str> = cache.get_or_try_insert_with("n", || async { Ok(5) }).await;
        let second: Result<u32, &str> = cache.get_or_try_insert_with("n", || async { Ok(9) }).await;
        assert_eq!(first, Ok(5));
        assert_eq!(second, Ok(5));
    }

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("account:*", "account:7:unlocks"));
        assert!(wildcard_match("*:unlocks", "account:7:unlocks"));
        assert!(wildcard_match("account:*:unlocks", "account:7:unlocks"));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
        assert!(!wildcard_match("account:*:unlocks", "account:7:balance"));
        assert!(!wildcard_match("resource:*", "account:1"));
    }
}
