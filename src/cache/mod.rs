use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use hyper::HeaderMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::utils::now_ms;

/// A response body plus the metadata needed to replay it
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Estimated retained size in bytes
    pub fn size_bytes(&self) -> u64 {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        (self.body.len() + header_bytes) as u64
    }
}

#[derive(Debug)]
struct Entry {
    value: CachedResponse,
    created_at_ms: u64,
    expires_at_ms: u64,
    access_count: u64,
    size_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    insertions: u64,
    deletions: u64,
    expirations: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Most recently used keys at the front
    lru: VecDeque<String>,
    total_bytes: u64,
    counters: Counters,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_front(key.to_string());
    }

    fn remove(&mut self, key: &str) -> bool {
        if let Some(entry) = self.entries.remove(key) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
            if let Some(pos) = self.lru.iter().position(|k| k == key) {
                self.lru.remove(pos);
            }
            true
        } else {
            false
        }
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub deletions: u64,
    pub expirations: u64,
    pub hit_ratio: f64,
}

/// Bounded in-memory response cache with TTL and least-recently-used
/// eviction against both an entry count and a byte budget.
pub struct ResponseCache {
    inner: RwLock<Inner>,
    max_entries: usize,
    max_bytes: u64,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(max_entries: usize, max_bytes: u64, default_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_entries,
            max_bytes,
            default_ttl,
        }
    }

    /// Fetch a live entry. Expired entries are removed, never served.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let now = now_ms();
        let mut inner = self.inner.write().await;

        enum Lookup {
            Hit(CachedResponse),
            Expired,
            Missing,
        }

        let lookup = match inner.entries.get_mut(key) {
            Some(entry) if entry.expires_at_ms > now => {
                entry.access_count += 1;
                Lookup::Hit(entry.value.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        };

        match lookup {
            Lookup::Hit(value) => {
                inner.counters.hits += 1;
                inner.touch(key);
                Some(value)
            }
            Lookup::Expired => {
                inner.remove(key);
                inner.counters.expirations += 1;
                inner.counters.misses += 1;
                None
            }
            Lookup::Missing => {
                inner.counters.misses += 1;
                None
            }
        }
    }

    /// Store an entry, evicting least-recently-used entries until both the
    /// entry and byte bounds hold. An entry larger than the byte budget is
    /// not stored at all.
    pub async fn set(&self, key: &str, value: CachedResponse, ttl: Option<Duration>) {
        let size = value.size_bytes();
        if size > self.max_bytes {
            debug!(key, size, "cache entry exceeds byte budget, not stored");
            return;
        }

        let now = now_ms();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.write().await;

        // Replace any existing entry before accounting for the new one
        inner.remove(key);

        while inner.entries.len() >= self.max_entries
            || inner.total_bytes + size > self.max_bytes
        {
            let victim = match inner.lru.pop_back() {
                Some(victim) => victim,
                None => break,
            };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
                inner.counters.evictions += 1;
            }
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at_ms: now,
                expires_at_ms: now + ttl.as_millis() as u64,
                access_count: 0,
                size_bytes: size,
            },
        );
        inner.total_bytes += size;
        inner.counters.insertions += 1;
        inner.touch(key);
    }

    /// Whether a live entry exists without counting a hit or miss
    pub async fn has(&self, key: &str) -> bool {
        let now = now_ms();
        let inner = self.inner.read().await;
        inner
            .entries
            .get(key)
            .map(|e| e.expires_at_ms > now)
            .unwrap_or(false)
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.remove(key);
        if removed {
            inner.counters.deletions += 1;
        }
        removed
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        let count = inner.entries.len() as u64;
        inner.entries.clear();
        inner.lru.clear();
        inner.total_bytes = 0;
        inner.counters.deletions += count;
    }

    /// Return the cached value, or produce, store and return it.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        ttl: Option<Duration>,
    ) -> Result<CachedResponse, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = producer().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Remove expired entries. Returns how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut inner = self.inner.write().await;

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at_ms <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        inner.counters.expirations += expired.len() as u64;
        expired.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        let c = &inner.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            entry_count: inner.entries.len(),
            total_bytes: inner.total_bytes,
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            insertions: c.insertions,
            deletions: c.deletions,
            expirations: c.expirations,
            hit_ratio: if lookups > 0 {
                c.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Age of an entry in milliseconds, for diagnostics
    pub async fn entry_age_ms(&self, key: &str) -> Option<u64> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(key)
            .map(|e| now_ms().saturating_sub(e.created_at_ms))
    }
}

/// Build the cache key for an HTTP request. Authenticated requests get a
/// user discriminator so personalized responses never cross principals.
pub fn http_key(method: &str, url: &str, headers: Option<&HeaderMap>) -> String {
    let user_part = headers.and_then(|h| {
        h.get("authorization")
            .or_else(|| h.get("x-user-id"))
            .and_then(|v| v.to_str().ok())
            .map(user_hash)
    });

    match user_part {
        Some(hash) => format!("http:{}:{}:user:{}", method, url, hash),
        None => format!("http:{}:{}", method, url),
    }
}

fn user_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Whether a response is eligible for caching: 2xx, no `no-cache` /
/// `no-store` directive, and no `Set-Cookie` header.
pub fn should_cache_response(status: u16, headers: &HeaderMap) -> bool {
    if !(200..300).contains(&status) {
        return false;
    }
    if headers.contains_key("set-cookie") {
        return false;
    }
    if let Some(cache_control) = headers.get("cache-control").and_then(|v| v.to_str().ok()) {
        let lowered = cache_control.to_ascii_lowercase();
        if lowered.contains("no-cache") || lowered.contains("no-store") {
            return false;
        }
    }
    true
}

/// Entry TTL derived from response headers: `max-age` wins, then a future
/// `Expires`; `None` means the default applies.
pub fn ttl_from_headers(headers: &HeaderMap) -> Option<Duration> {
    if let Some(cache_control) = headers.get("cache-control").and_then(|v| v.to_str().ok()) {
        if let Some(max_age) = cache_control
            .split(',')
            .map(str::trim)
            .find_map(|d| d.strip_prefix("max-age="))
            .and_then(|v| v.parse::<u64>().ok())
        {
            return Some(Duration::from_secs(max_age));
        }
    }

    if let Some(expires) = headers.get("expires").and_then(|v| v.to_str().ok()) {
        if let Ok(expires_at) = httpdate::parse_http_date(expires) {
            let now = std::time::SystemTime::now();
            if let Ok(remaining) = expires_at.duration_since(now) {
                return Some(remaining);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    fn small_cache(max_entries: usize) -> ResponseCache {
        ResponseCache::new(max_entries, 1024 * 1024, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn lru_eviction_prefers_least_recently_used() {
        let cache = small_cache(3);

        cache.set("k1", response("one"), None).await;
        cache.set("k2", response("two"), None).await;
        cache.set("k3", response("three"), None).await;

        // Touch k1 so k2 becomes the eviction victim
        assert!(cache.get("k1").await.is_some());
        cache.set("k4", response("four"), None).await;

        assert!(cache.get("k1").await.is_some());
        assert!(cache.get("k2").await.is_none());
        assert!(cache.get("k3").await.is_some());
        assert!(cache.get("k4").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn byte_budget_is_enforced() {
        let cache = ResponseCache::new(100, 64, Duration::from_secs(60));

        let big = CachedResponse {
            status: 200,
            headers: vec![],
            body: Bytes::from(vec![0u8; 40]),
        };
        cache.set("a", big.clone(), None).await;
        cache.set("b", big.clone(), None).await;

        // Both cannot fit in 64 bytes; "a" was evicted
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.stats().await.total_bytes <= 64);
    }

    #[tokio::test]
    async fn oversized_entry_is_not_stored() {
        let cache = ResponseCache::new(100, 16, Duration::from_secs(60));
        let big = CachedResponse {
            status: 200,
            headers: vec![],
            body: Bytes::from(vec![0u8; 64]),
        };
        cache.set("big", big, None).await;
        assert!(!cache.has("big").await);
    }

    #[tokio::test]
    async fn expired_entries_are_never_served() {
        let cache = small_cache(10);
        cache
            .set("k", response("v"), Some(Duration::from_millis(20)))
            .await;
        assert!(cache.get("k").await.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().await.expirations, 1);
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries() {
        let cache = small_cache(10);
        cache
            .set("short", response("v"), Some(Duration::from_millis(10)))
            .await;
        cache
            .set("long", response("v"), Some(Duration::from_secs(60)))
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.sweep_expired().await, 1);
        assert!(cache.has("long").await);
    }

    #[tokio::test]
    async fn get_or_set_produces_once() {
        let cache = small_cache(10);

        let first: Result<_, std::convert::Infallible> = cache
            .get_or_set("k", || async { Ok(response("produced")) }, None)
            .await;
        assert_eq!(first.unwrap().body, Bytes::from("produced"));

        // Second call is served from the cache; the producer must not run
        let second: Result<_, std::convert::Infallible> = cache
            .get_or_set("k", || async { panic!("producer re-invoked") }, None)
            .await;
        assert_eq!(second.unwrap().body, Bytes::from("produced"));
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let cache = small_cache(10);
        cache.set("k1", response("v"), None).await;
        cache.set("k2", response("v"), None).await;

        assert!(cache.delete("k1").await);
        assert!(!cache.delete("k1").await);

        cache.clear().await;
        assert!(!cache.has("k2").await);
        assert_eq!(cache.stats().await.entry_count, 0);
        assert_eq!(cache.stats().await.total_bytes, 0);
    }

    #[test]
    fn personalized_keys_differ_by_principal() {
        let mut alice = HeaderMap::new();
        alice.insert("authorization", HeaderValue::from_static("Bearer alice"));
        let mut bob = HeaderMap::new();
        bob.insert("authorization", HeaderValue::from_static("Bearer bob"));

        let anon = http_key("GET", "http://gw/api/x", None);
        let alice_key = http_key("GET", "http://gw/api/x", Some(&alice));
        let bob_key = http_key("GET", "http://gw/api/x", Some(&bob));

        assert_ne!(alice_key, bob_key);
        assert_ne!(alice_key, anon);
        assert!(anon.starts_with("http:GET:"));
        assert!(alice_key.contains(":user:"));
    }

    #[test]
    fn cacheability_rules() {
        let mut headers = HeaderMap::new();
        assert!(should_cache_response(200, &headers));
        assert!(!should_cache_response(404, &headers));
        assert!(!should_cache_response(500, &headers));

        headers.insert("cache-control", HeaderValue::from_static("no-store"));
        assert!(!should_cache_response(200, &headers));
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        assert!(!should_cache_response(200, &headers));
        headers.insert("cache-control", HeaderValue::from_static("max-age=60"));
        assert!(should_cache_response(200, &headers));

        headers.insert("set-cookie", HeaderValue::from_static("session=abc"));
        assert!(!should_cache_response(200, &headers));
    }

    #[test]
    fn ttl_prefers_max_age_over_expires() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cache-control",
            HeaderValue::from_static("public, max-age=120"),
        );
        assert_eq!(ttl_from_headers(&headers), Some(Duration::from_secs(120)));

        let mut headers = HeaderMap::new();
        headers.insert(
            "expires",
            HeaderValue::from_str(
                &httpdate::fmt_http_date(std::time::SystemTime::now() + Duration::from_secs(90)),
            )
            .unwrap(),
        );
        let ttl = ttl_from_headers(&headers).unwrap();
        assert!(ttl <= Duration::from_secs(90) && ttl > Duration::from_secs(80));

        let mut headers = HeaderMap::new();
        headers.insert(
            "expires",
            HeaderValue::from_str(
                &httpdate::fmt_http_date(std::time::SystemTime::now() - Duration::from_secs(90)),
            )
            .unwrap(),
        );
        assert_eq!(ttl_from_headers(&headers), None);

        assert_eq!(ttl_from_headers(&HeaderMap::new()), None);
    }
}
