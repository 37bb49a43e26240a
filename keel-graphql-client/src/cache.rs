//! In-memory response cache.
//!
//! Entries are keyed by [`OperationKey`] and expire after a TTL. The store is
//! bounded by a maximum entry count; insertion order approximates recency (a
//! hit moves the entry to the back, eviction takes from the front), which
//! gives an approximate LRU policy.

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::operation::OperationKey;
use crate::{GraphQLError, Result};

#[derive(Debug)]
struct CacheEntry {
    data: Value,
    expires_at: Instant,
    seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<OperationKey, CacheEntry>,
    /// Recency order: lowest sequence number is the oldest entry.
    order: BTreeMap<u64, OperationKey>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn remove(&mut self, key: &OperationKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn touch(&mut self, key: &OperationKey) {
        let seq = self.bump();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.seq);
            entry.seq = seq;
            self.order.insert(seq, key.clone());
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.entries.remove(&key);
            self.evictions += 1;
            debug!(key = %key, "Evicted cache entry at capacity");
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Live entries (expired entries not yet swept are included).
    pub entries: usize,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries dropped to stay under the size bound.
    pub evictions: u64,
}

/// TTL-keyed, size-bounded response cache.
#[derive(Debug)]
pub struct ResponseCache {
    state: Mutex<CacheState>,
    default_ttl: Duration,
    max_size: usize,
}

impl ResponseCache {
    /// Create a cache from configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.max_size, config.ttl)
    }

    /// Create a cache with explicit bounds.
    pub fn with_capacity(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            default_ttl,
            max_size: max_size.max(1),
        }
    }

    /// Look up a cached result, dropping it if it has expired.
    pub fn get(&self, operation: &str, variables: Option<&Value>) -> Option<Value> {
        self.get_by_key(&OperationKey::new(operation, variables))
    }

    pub(crate) fn get_by_key(&self, key: &OperationKey) -> Option<Value> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.remove(key);
            state.misses += 1;
            return None;
        }

        state.touch(key);
        state.hits += 1;
        state.entries.get(key).map(|entry| entry.data.clone())
    }

    /// Store a result, evicting the oldest entry when at capacity.
    pub fn set(
        &self,
        operation: &str,
        variables: Option<&Value>,
        data: Value,
        ttl: Option<Duration>,
    ) {
        self.set_by_key(OperationKey::new(operation, variables), data, ttl);
    }

    pub(crate) fn set_by_key(&self, key: OperationKey, data: Value, ttl: Option<Duration>) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        let mut state = self.state.lock();

        if state.remove(&key).is_none() && state.entries.len() >= self.max_size {
            state.evict_oldest();
        }

        let seq = state.bump();
        state.order.insert(seq, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                data,
                expires_at,
                seq,
            },
        );
    }

    /// Remove entries. With no pattern everything is cleared; otherwise every
    /// entry whose operation key matches the regular expression is removed.
    ///
    /// Returns the number of removed entries.
    pub fn invalidate(&self, pattern: Option<&str>) -> Result<usize> {
        let Some(pattern) = pattern else {
            let mut state = self.state.lock();
            let removed = state.entries.len();
            state.entries.clear();
            state.order.clear();
            return Ok(removed);
        };

        let regex = Regex::new(pattern).map_err(|e| {
            GraphQLError::Config(format!("invalid cache pattern '{}': {}", pattern, e))
        })?;

        let mut state = self.state.lock();
        let doomed: Vec<OperationKey> = state
            .entries
            .keys()
            .filter(|key| regex.is_match(key.as_str()))
            .cloned()
            .collect();
        for key in &doomed {
            state.remove(key);
        }

        debug!(pattern, removed = doomed.len(), "Invalidated cache entries");
        Ok(doomed.len())
    }

    /// Replace a cached value with `updater(cached)`, keeping its expiry.
    ///
    /// Returns `false` (and does nothing) when no live value is cached.
    pub fn update<F>(&self, operation: &str, variables: Option<&Value>, updater: F) -> bool
    where
        F: FnOnce(Value) -> Value,
    {
        let key = OperationKey::new(operation, variables);
        let now = Instant::now();
        let mut state = self.state.lock();

        match state.entries.get(&key) {
            None => return false,
            Some(entry) if entry.is_expired(now) => {
                state.remove(&key);
                return false;
            }
            Some(_) => {}
        }

        if let Some(entry) = state.entries.get_mut(&key) {
            let current = std::mem::take(&mut entry.data);
            entry.data = updater(current);
        }
        true
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Sweep expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<OperationKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Default TTL applied when `set` is given none.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const Q: &str = "query GetUser($id: ID!) { user(id: $id) { name } }";

    fn cache(max_size: usize) -> ResponseCache {
        ResponseCache::with_capacity(max_size, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = cache(10);
        let vars = json!({"id": "1"});
        cache.set(
            Q,
            Some(&vars),
            json!({"user": {"name": "Ada"}}),
            Some(Duration::from_millis(100)),
        );

        assert_eq!(cache.get(Q, Some(&vars)), Some(json!({"user": {"name": "Ada"}})));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get(Q, Some(&vars)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_sensitivity() {
        let cache = cache(10);
        cache.set(Q, Some(&json!({"a": 1, "b": 2})), json!("hit"), None);

        assert_eq!(cache.get(Q, Some(&json!({"b": 2, "a": 1}))), Some(json!("hit")));
        assert_eq!(cache.get(Q, Some(&json!({"a": 2, "b": 2}))), None);

        cache.set(Q, Some(&json!({"a": 1})), json!(1), None);
        cache.set(Q, Some(&json!({"a": 2})), json!(2), None);
        assert_eq!(cache.get(Q, Some(&json!({"a": 1}))), Some(json!(1)));
        assert_eq!(cache.get(Q, Some(&json!({"a": 2}))), Some(json!(2)));
    }

    #[test]
    fn test_whitespace_insensitive_lookup() {
        let cache = cache(10);
        cache.set("query {\n  viewer { id }\n}", None, json!({"viewer": {"id": 1}}), None);
        assert!(cache.get("query { viewer { id } }", None).is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = cache(2);
        cache.set("query A { a }", None, json!("a"), None);
        cache.set("query B { b }", None, json!("b"), None);
        cache.set("query C { c }", None, json!("c"), None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("query A { a }", None), None);
        assert_eq!(cache.get("query C { c }", None), Some(json!("c")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_hit_refreshes_recency() {
        let cache = cache(2);
        cache.set("query A { a }", None, json!("a"), None);
        cache.set("query B { b }", None, json!("b"), None);

        // A becomes most recent, so B is evicted next
        assert!(cache.get("query A { a }", None).is_some());
        cache.set("query C { c }", None, json!("c"), None);

        assert_eq!(cache.get("query B { b }", None), None);
        assert_eq!(cache.get("query A { a }", None), Some(json!("a")));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = cache(2);
        cache.set("query A { a }", None, json!("a"), None);
        cache.set("query B { b }", None, json!("b"), None);
        cache.set("query A { a }", None, json!("a2"), None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("query B { b }", None), Some(json!("b")));
        assert_eq!(cache.get("query A { a }", None), Some(json!("a2")));
    }

    #[test]
    fn test_invalidate_by_pattern() {
        let cache = cache(10);
        cache.set("query Users { users { id } }", None, json!([]), None);
        cache.set("query UserById { user { id } }", Some(&json!({"id": 1})), json!({}), None);
        cache.set("query Posts { posts { id } }", None, json!([]), None);

        let removed = cache.invalidate(Some("^query User")).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("query Posts { posts { id } }", None).is_some());
    }

    #[test]
    fn test_invalidate_all_and_bad_pattern() {
        let cache = cache(10);
        cache.set("query A { a }", None, json!("a"), None);

        assert!(matches!(cache.invalidate(Some("(")), Err(GraphQLError::Config(_))));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.invalidate(None).unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_existing_and_missing() {
        let cache = cache(10);
        assert!(!cache.update(Q, None, |v| v));

        cache.set(Q, None, json!({"count": 1}), None);
        let updated = cache.update(Q, None, |mut v| {
            v["count"] = json!(2);
            v
        });
        assert!(updated);
        assert_eq!(cache.get(Q, None), Some(json!({"count": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = cache(10);
        cache.set("query A { a }", None, json!("a"), Some(Duration::from_millis(10)));
        cache.set("query B { b }", None, json!("b"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
