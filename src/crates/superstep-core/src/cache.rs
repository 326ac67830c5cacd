//! Result cache for node executions
//!
//! A node opts in with a [`CachePolicy`]. Before such a task runs, the
//! executor derives a [`CacheKey`] from the node name and the task input; on a
//! hit the body is skipped and the writes recorded for that key are reused,
//! including the edge and routing writes, so the graph continues exactly as if
//! the node had run. Cached results show up as `cached: true` in `TaskEnd` and
//! `Updates` events.
//!
//! Only successful executions are cached; suspended or failed tasks are not.
//!
//! ```rust
//! use superstep_core::{BaseCache, CacheKey, InMemoryCache};
//! use serde_json::json;
//!
//! # async fn example() -> superstep_core::Result<()> {
//! let cache = InMemoryCache::new();
//! let key = CacheKey::new("summarize", "input-digest");
//! cache.put(key.clone(), json!([["summary", "short"]]), Some(60)).await?;
//! assert!(cache.get(&key).await?.is_some());
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const CACHE_NAMESPACE: Uuid = Uuid::from_u128(0x2b9e_54a1_7c3d_4f80_a6b2_c1d0_e9f8_0717);

/// Address of a cached result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Namespace of the entry, starting with the node name
    pub ns: Vec<String>,
    pub key: String,
}

impl CacheKey {
    pub fn new(node: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            ns: vec![node.into()],
            key: key.into(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}|{}", self.ns.join("|"), self.key)
    }
}

/// Function deriving a cache key from a task input
pub type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Opt-in caching of a node's results
#[derive(Clone)]
pub struct CachePolicy {
    pub key_func: KeyFn,

    /// Time to live in seconds; `None` never expires
    pub ttl: Option<u64>,
}

impl CachePolicy {
    /// Cache by the full input, forever
    pub fn new() -> Self {
        Self {
            key_func: Arc::new(default_key),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    /// Derive keys from only part of the input
    pub fn with_key_func<F>(mut self, key_func: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.key_func = Arc::new(key_func);
        self
    }

    pub(crate) fn key_for(&self, node: &str, input: &Value) -> CacheKey {
        CacheKey::new(node, (self.key_func)(input))
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("key_func", &"<function>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// UUIDv5 of the input with object keys sorted at every level
fn default_key(input: &Value) -> String {
    Uuid::new_v5(&CACHE_NAMESPACE, canonical(input).to_string().as_bytes()).to_string()
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Expiry time for a TTL; `None` when it lies beyond what can be represented
fn expiry(now: DateTime<Utc>, ttl_seconds: u64) -> Option<DateTime<Utc>> {
    let ttl = Duration::try_seconds(i64::try_from(ttl_seconds).ok()?)?;
    now.checked_add_signed(ttl)
}

/// Storage for cached node results
#[async_trait]
pub trait BaseCache: Send + Sync {
    /// Get a value; `None` if missing or expired
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>>;

    /// Store a value with an optional time to live in seconds
    async fn put(&self, key: CacheKey, value: Value, ttl_seconds: Option<u64>) -> Result<()>;

    /// Remove every entry, returning how many were removed
    async fn clear(&self) -> Result<usize>;
}

#[derive(Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Process-local cache with lazy expiry
#[derive(Clone, Default)]
pub struct InMemoryCache {
    data: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl BaseCache for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        let storage_key = key.storage_key();
        let now = Utc::now();
        let mut data = self.data.write();
        match data.get(&storage_key) {
            Some(entry) if entry.is_expired(now) => {
                data.remove(&storage_key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: CacheKey, value: Value, ttl_seconds: Option<u64>) -> Result<()> {
        let expires_at = ttl_seconds.and_then(|secs| expiry(Utc::now(), secs));
        self.data
            .write()
            .insert(key.storage_key(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn clear(&self) -> Result<usize> {
        let mut data = self.data.write();
        let count = data.len();
        data.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_clear() {
        let cache = InMemoryCache::new();
        let key = CacheKey::new("node", "k");

        assert_eq!(cache.get(&key).await.unwrap(), None);
        cache.put(key.clone(), json!(42), None).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(json!(42)));

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let cache = InMemoryCache::new();
        let key = CacheKey::new("node", "k");
        cache.put(key.clone(), json!(1), Some(0)).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let cache = InMemoryCache::new();
        let ttls = [u64::MAX, 10_000_000_000_000_000, i64::MAX as u64];
        for (i, ttl) in ttls.into_iter().enumerate() {
            let key = CacheKey::new("node", i.to_string());
            cache.put(key.clone(), json!(i), Some(ttl)).await.unwrap();
            assert_eq!(cache.get(&key).await.unwrap(), Some(json!(i)));
        }
    }

    #[test]
    fn test_expiry_bounds() {
        let now = Utc::now();
        assert_eq!(expiry(now, 0), Some(now));
        assert_eq!(expiry(now, 60), Some(now + Duration::seconds(60)));
        assert_eq!(expiry(now, u64::MAX), None);
        assert_eq!(expiry(now, i64::MAX as u64), None);
    }

    #[tokio::test]
    async fn test_keys_are_scoped_by_node() {
        let cache = InMemoryCache::new();
        cache.put(CacheKey::new("a", "k"), json!("a"), None).await.unwrap();
        assert_eq!(cache.get(&CacheKey::new("b", "k")).await.unwrap(), None);
    }

    #[test]
    fn test_default_key_is_stable() {
        let policy = CachePolicy::new();
        let a = policy.key_for("n", &json!({"x": 1, "y": 2}));
        let b = policy.key_for("n", &json!({"y": 2, "x": 1}));
        let c = policy.key_for("n", &json!({"x": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_canonical_sorts_nested_keys() {
        let mut inner = serde_json::Map::new();
        inner.insert("z".to_string(), json!(1));
        inner.insert("a".to_string(), json!([{"y": 1, "b": 2}]));
        let sorted = canonical(&Value::Object(inner));
        assert_eq!(sorted.to_string(), r#"{"a":[{"b":2,"y":1}],"z":1}"#);
    }

    #[test]
    fn test_custom_key_func() {
        let policy = CachePolicy::new()
            .with_ttl(30)
            .with_key_func(|input| input["id"].to_string());
        let key = policy.key_for("n", &json!({"id": 7, "noise": "x"}));
        assert_eq!(key.key, "7");
        assert_eq!(policy.ttl, Some(30));
    }
}
