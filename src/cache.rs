//! `CacheLayer`: a TTL key-value store abstraction with two backends.
//!
//! Both backends provide monotonic TTL semantics — a `get` never returns a
//! value whose expiry has passed, actively evicting on read. Cache
//! failures are non-fatal: a backend error is always treated as a miss
//! and logged, never propagated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

/// `Get`/`Set`/`Delete` over TTL'd string values, keyed by an opaque
/// string the caller constructs (see [`crate::context::cache_key`]).
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Returns `(value, true)` on a hit, `(None, false)` on a miss or
    /// backend error.
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: String, ttl: Duration);

    async fn delete(&self, key: &str);
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local backend: a sharded concurrent map protecting each shard
/// with its own lock, so that different keys never contend. Reads
/// actively evict expired entries rather than returning them.
pub struct InProcessCache {
    entries: Arc<DashMap<String, Entry>>,
}

impl InProcessCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InProcessCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheLayer for InProcessCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        // Evict-on-read: a present-but-expired entry is removed and
        // treated as absent, never returned to the caller.
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.entries.remove(key);
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Remote shared-store backend, delegating to a store that exposes a
/// `SETEX`-equivalent HTTP interface (`PUT /cache/{key}?ttl_secs=N`,
/// `GET /cache/{key}`, `DELETE /cache/{key}`). Connection failures are
/// swallowed and reported as a miss — the caller never sees
/// `CacheUnavailable` as a propagated error, only as a log line.
pub struct RemoteCache {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteCache {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CacheLayer for RemoteCache {
    async fn get(&self, key: &str) -> Option<String> {
        let url = format!("{}/cache/{key}", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
            Ok(resp) if resp.status().as_u16() == 404 => None,
            Ok(resp) => {
                warn!(status = %resp.status(), "cache backend returned an error, treating as miss");
                None
            }
            Err(e) => {
                warn!(error = %e, "cache backend unreachable, treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let url = format!("{}/cache/{key}?ttl_secs={}", self.base_url, ttl.as_secs());
        if let Err(e) = self.client.put(&url).body(value).send().await {
            warn!(error = %e, "cache backend unreachable, write dropped");
        }
    }

    async fn delete(&self, key: &str) {
        let url = format!("{}/cache/{key}", self.base_url);
        if let Err(e) = self.client.delete(&url).send().await {
            warn!(error = %e, "cache backend unreachable, delete dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_within_ttl_returns_exact_value() {
        let cache = InProcessCache::new();
        cache.set("k1", "v1".to_string(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k1").await, Some("v1".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_read() {
        let cache = InProcessCache::new();
        cache.set("k1", "v1".to_string(), Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k1").await, None);
        assert!(cache.entries.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = InProcessCache::new();
        cache.set("k1", "v1".to_string(), Duration::from_secs(60)).await;
        cache.delete("k1").await;
        assert_eq!(cache.get("k1").await, None);
    }

    #[tokio::test]
    async fn miss_on_unknown_key() {
        let cache = InProcessCache::new();
        assert_eq!(cache.get("nope").await, None);
    }

    // No `get` ever returns a value whose stored expiry has already
    // passed, for any past/future offset the entry was stamped with.
    proptest::proptest! {
        #[test]
        fn an_entry_past_its_expiry_is_never_returned(past_ms in 1u64..10_000) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result = rt.block_on(async {
                let cache = InProcessCache::new();
                let expires_at = Instant::now() - Duration::from_millis(past_ms);
                cache.entries.insert("k".to_string(), Entry { value: "v".to_string(), expires_at });
                cache.get("k").await
            });
            proptest::prop_assert_eq!(result, None);
        }

        #[test]
        fn an_entry_before_its_expiry_is_returned_exactly(future_ms in 1u64..10_000) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result = rt.block_on(async {
                let cache = InProcessCache::new();
                let expires_at = Instant::now() + Duration::from_millis(future_ms);
                cache.entries.insert("k".to_string(), Entry { value: "v".to_string(), expires_at });
                cache.get("k").await
            });
            proptest::prop_assert_eq!(result, Some("v".to_string()));
        }
    }
}
