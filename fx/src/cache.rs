//! Rate caching with jittered TTL over a pluggable backend.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use dashmap::DashMap;
use rand::Rng;
use ratemesh_common::{constants, now, CurrencyCode, Timestamp};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RateError, RateResult};

/// Identifies one quoted rate on one day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateKey {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub date: NaiveDate,
}

impl RateKey {
    pub fn new(from: CurrencyCode, to: CurrencyCode, date: NaiveDate) -> Self {
        Self { from, to, date }
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.from, self.to, self.date.format("%Y-%m-%d"))
    }
}

/// Cached rate entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub rate: f64,
    pub provider_id: String,
    pub fetched_at: Timestamp,
    pub expires_at: Timestamp,
}

impl CacheEntry {
    /// Whether the entry is past its expiry at `at`.
    pub fn is_expired_at(&self, at: Timestamp) -> bool {
        at >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now())
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: String,
    pub size: usize,
    pub sample_keys: Vec<String>,
}

/// Storage strategy behind [`RateCache`].
///
/// Backends store entries as given and must treat an entry past its
/// `expires_at` as absent.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs and stats.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> RateResult<Option<CacheEntry>>;

    async fn set(&self, key: &str, entry: &CacheEntry) -> RateResult<()>;

    async fn delete(&self, key: &str) -> RateResult<()>;

    async fn clear(&self) -> RateResult<()>;

    /// Live entry count and up to `sample` keys.
    async fn stats(&self, sample: usize) -> RateResult<CacheStats>;

    async fn get_many(&self, keys: &[String]) -> RateResult<Vec<Option<CacheEntry>>> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            entries.push(self.get(key).await?);
        }
        Ok(entries)
    }

    async fn set_many(&self, entries: &[(String, CacheEntry)]) -> RateResult<()> {
        for (key, entry) in entries {
            self.set(key, entry).await?;
        }
        Ok(())
    }
}

/// In-process backend for single-instance deployments.
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let at = now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(at));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> RateResult<Option<CacheEntry>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> RateResult<()> {
        self.entries.insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> RateResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> RateResult<()> {
        self.entries.clear();
        Ok(())
    }

    async fn stats(&self, sample: usize) -> RateResult<CacheStats> {
        let at = now();
        let live: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired_at(at))
            .map(|e| e.key().clone())
            .collect();

        Ok(CacheStats {
            backend: self.name().to_string(),
            size: live.len(),
            sample_keys: live.into_iter().take(sample).collect(),
        })
    }
}

/// Shared backend for multi-instance deployments.
pub struct RedisCacheBackend {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisCacheBackend {
    /// Default key prefix.
    pub const DEFAULT_PREFIX: &'static str = "ratemesh:rate:";

    /// Connect to Redis (e.g. `redis://127.0.0.1`).
    pub async fn connect(redis_url: &str) -> RateResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        debug!(url = %redis_url, "Redis cache connected");

        Ok(Self {
            connection,
            prefix: Self::DEFAULT_PREFIX.to_string(),
        })
    }

    /// Use a custom key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn ttl_seconds(entry: &CacheEntry) -> u64 {
        (entry.expires_at - now()).num_seconds().max(1) as u64
    }

    fn decode(raw: Option<String>) -> RateResult<Option<CacheEntry>> {
        let Some(json) = raw else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_str(&json)
            .map_err(|e| RateError::Cache(format!("Corrupt cache entry: {}", e)))?;
        Ok((!entry.is_expired()).then_some(entry))
    }

    fn encode(entry: &CacheEntry) -> RateResult<String> {
        serde_json::to_string(entry).map_err(|e| RateError::Cache(e.to_string()))
    }

    async fn scan_keys(&self) -> RateResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> RateResult<Option<CacheEntry>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.full_key(key)).await?;
        Self::decode(raw)
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> RateResult<()> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(self.full_key(key), Self::encode(entry)?, Self::ttl_seconds(entry))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> RateResult<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(self.full_key(key)).await?;
        Ok(())
    }

    async fn clear(&self) -> RateResult<()> {
        let keys = self.scan_keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn stats(&self, sample: usize) -> RateResult<CacheStats> {
        let keys = self.scan_keys().await?;
        let prefix_len = self.prefix.len();

        Ok(CacheStats {
            backend: self.name().to_string(),
            size: keys.len(),
            sample_keys: keys
                .iter()
                .take(sample)
                .map(|k| k[prefix_len.min(k.len())..].to_string())
                .collect(),
        })
    }

    async fn get_many(&self, keys: &[String]) -> RateResult<Vec<Option<CacheEntry>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&full).query_async(&mut conn).await?;
        raw.into_iter().map(Self::decode).collect()
    }

    async fn set_many(&self, entries: &[(String, CacheEntry)]) -> RateResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, entry) in entries {
            pipe.set_ex(self.full_key(key), Self::encode(entry)?, Self::ttl_seconds(entry))
                .ignore();
        }
        let mut conn = self.connection.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// Configuration for the rate cache.
#[derive(Debug, Clone)]
pub struct RateCacheConfig {
    /// Base time to live.
    pub ttl: Duration,
    /// Symmetric random variance added to `ttl` on every write.
    pub jitter: Duration,
    /// Keys returned by [`RateCache::stats`].
    pub stats_sample: usize,
}

impl Default for RateCacheConfig {
    fn default() -> Self {
        Self {
            ttl: constants::cache_ttl(),
            jitter: constants::cache_jitter(),
            stats_sample: 10,
        }
    }
}

/// Rate cache keyed by `(from, to, date)`.
///
/// Backend failures never reach callers: reads degrade to misses and
/// writes to no-ops.
pub struct RateCache {
    backend: Arc<dyn CacheBackend>,
    config: RateCacheConfig,
}

impl RateCache {
    /// Create a cache over the given backend with default configuration.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_config(backend, RateCacheConfig::default())
    }

    /// Create a cache with custom configuration.
    pub fn with_config(backend: Arc<dyn CacheBackend>, config: RateCacheConfig) -> Self {
        Self { backend, config }
    }

    /// In-process cache with default configuration.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Get a live entry.
    pub async fn get(&self, key: &RateKey) -> Option<CacheEntry> {
        match self.backend.get(&key.to_string()).await {
            Ok(Some(entry)) => {
                debug!(key = %key, "Cache hit");
                Some(entry)
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(
                    key = %key,
                    backend = self.backend.name(),
                    error = %e,
                    "Cache read failed, treating as miss"
                );
                None
            }
        }
    }

    /// Write one rate and return the entry as stored.
    pub async fn set(&self, key: &RateKey, rate: f64, provider_id: &str) -> CacheEntry {
        let entry = self.new_entry(rate, provider_id, self.draw_expiry_offset());

        if let Err(e) = self.backend.set(&key.to_string(), &entry).await {
            warn!(key = %key, backend = self.backend.name(), error = %e, "Cache write failed");
        }
        entry
    }

    /// Look up many keys at once; the result is aligned with `keys`.
    pub async fn get_batch(&self, keys: &[RateKey]) -> Vec<Option<CacheEntry>> {
        let raw: Vec<String> = keys.iter().map(ToString::to_string).collect();

        match self.backend.get_many(&raw).await {
            Ok(entries) if entries.len() == keys.len() => entries,
            Ok(entries) => {
                warn!(
                    expected = keys.len(),
                    got = entries.len(),
                    "Cache batch size mismatch, treating as misses"
                );
                vec![None; keys.len()]
            }
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    error = %e,
                    "Cache batch read failed, treating as misses"
                );
                vec![None; keys.len()]
            }
        }
    }

    /// Write a batch of rates from one provider with a single TTL draw.
    pub async fn set_batch(&self, rates: &[(RateKey, f64)], provider_id: &str) -> Vec<CacheEntry> {
        let offset = self.draw_expiry_offset();
        let entries: Vec<(String, CacheEntry)> = rates
            .iter()
            .map(|(key, rate)| (key.to_string(), self.new_entry(*rate, provider_id, offset)))
            .collect();

        if let Err(e) = self.backend.set_many(&entries).await {
            warn!(
                backend = self.backend.name(),
                count = entries.len(),
                error = %e,
                "Cache batch write failed"
            );
        } else {
            debug!(count = entries.len(), provider = provider_id, "Cached rate batch");
        }

        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    pub async fn delete(&self, key: &RateKey) {
        if let Err(e) = self.backend.delete(&key.to_string()).await {
            warn!(key = %key, error = %e, "Cache delete failed");
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.backend.clear().await {
            warn!(backend = self.backend.name(), error = %e, "Cache clear failed");
        }
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        match self.backend.stats(self.config.stats_sample).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Cache stats unavailable");
                CacheStats {
                    backend: self.backend.name().to_string(),
                    ..Default::default()
                }
            }
        }
    }

    /// TTL plus a uniform draw from `[-jitter, +jitter]`.
    fn draw_expiry_offset(&self) -> Duration {
        let jitter_ms = self.config.jitter.num_milliseconds().abs();
        let offset_ms = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(-jitter_ms..=jitter_ms)
        };
        self.config.ttl + Duration::milliseconds(offset_ms)
    }

    fn new_entry(&self, rate: f64, provider_id: &str, lifetime: Duration) -> CacheEntry {
        let fetched_at = now();
        CacheEntry {
            rate,
            provider_id: provider_id.to_string(),
            fetched_at,
            expires_at: fetched_at + lifetime,
        }
    }
}

impl Default for RateCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Shared rate cache.
pub type SharedRateCache = Arc<RateCache>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key(from: &str, to: &str) -> RateKey {
        RateKey::new(
            CurrencyCode::parse(from).unwrap(),
            CurrencyCode::parse(to).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        )
    }

    /// Backend that fails every call.
    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }
        async fn get(&self, _key: &str) -> RateResult<Option<CacheEntry>> {
            Err(RateError::Cache("down".into()))
        }
        async fn set(&self, _key: &str, _entry: &CacheEntry) -> RateResult<()> {
            Err(RateError::Cache("down".into()))
        }
        async fn delete(&self, _key: &str) -> RateResult<()> {
            Err(RateError::Cache("down".into()))
        }
        async fn clear(&self) -> RateResult<()> {
            Err(RateError::Cache("down".into()))
        }
        async fn stats(&self, _sample: usize) -> RateResult<CacheStats> {
            Err(RateError::Cache("down".into()))
        }
    }

    #[test]
    fn test_key_format() {
        let k = RateKey::new(
            CurrencyCode::parse("usd").unwrap(),
            CurrencyCode::parse("eur").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        );
        assert_eq!(k.to_string(), "USD:EUR:2024-01-02");
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = RateCache::in_memory();
        let k = key("USD", "EUR");

        cache.set(&k, 0.92, "ecb").await;

        let entry = cache.get(&k).await.unwrap();
        assert_eq!(entry.rate, 0.92);
        assert_eq!(entry.provider_id, "ecb");
        assert!(cache.get(&key("USD", "GBP")).await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_within_jitter_bounds() {
        let cache = RateCache::in_memory();

        for i in 0..50 {
            let before = now();
            let entry = cache.set(&key("USD", "EUR"), 0.9 + i as f64 * 0.001, "p").await;
            let after = now();

            assert!(entry.expires_at >= before + Duration::minutes(110));
            assert!(entry.expires_at <= after + Duration::minutes(130));
        }
    }

    #[tokio::test]
    async fn test_batch_shares_expiry() {
        let cache = RateCache::in_memory();
        let rates = vec![
            (key("USD", "EUR"), 0.92),
            (key("USD", "GBP"), 0.79),
            (key("USD", "JPY"), 150.0),
        ];

        let written = cache.set_batch(&rates, "ecb").await;
        let offsets: Vec<_> = written.iter().map(|e| e.expires_at - e.fetched_at).collect();
        assert!(offsets.windows(2).all(|w| w[0] == w[1]));

        let keys: Vec<RateKey> = rates.iter().map(|(k, _)| k.clone()).collect();
        let mut lookup = keys.clone();
        lookup.push(key("USD", "CHF"));
        let found = cache.get_batch(&lookup).await;
        assert_eq!(found.len(), 4);
        assert_eq!(found[1].as_ref().unwrap().rate, 0.79);
        assert!(found[3].is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_unreadable() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = RateCache::with_config(
            backend.clone(),
            RateCacheConfig {
                ttl: Duration::milliseconds(30),
                jitter: Duration::zero(),
                stats_sample: 10,
            },
        );
        let k = key("USD", "EUR");

        cache.set(&k, 0.92, "p").await;
        assert!(cache.get(&k).await.is_some());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(cache.get(&k).await.is_none());
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let backend = MemoryCacheBackend::new();
        let t = now();
        let stale = CacheEntry {
            rate: 1.1,
            provider_id: "p".into(),
            fetched_at: t - Duration::hours(3),
            expires_at: t - Duration::hours(1),
        };
        let fresh = CacheEntry {
            expires_at: t + Duration::hours(1),
            ..stale.clone()
        };
        backend.set("a", &stale).await.unwrap();
        backend.set("b", &fresh).await.unwrap();

        assert_eq!(backend.purge_expired(), 1);
        assert!(backend.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_clear_and_stats() {
        let cache = RateCache::in_memory();
        cache.set(&key("USD", "EUR"), 0.92, "p").await;
        cache.set(&key("GBP", "USD"), 1.27, "p").await;

        let stats = cache.stats().await;
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.size, 2);
        assert_eq!(stats.sample_keys.len(), 2);

        cache.delete(&key("USD", "EUR")).await;
        assert!(cache.get(&key("USD", "EUR")).await.is_none());

        cache.clear().await;
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_broken_backend_degrades() {
        let cache = RateCache::new(Arc::new(BrokenBackend));
        let k = key("USD", "EUR");

        let entry = cache.set(&k, 0.92, "p").await;
        assert_eq!(entry.rate, 0.92);
        assert!(cache.get(&k).await.is_none());
        assert_eq!(cache.get_batch(&[k.clone()]).await, vec![None]);
        cache.set_batch(&[(k.clone(), 0.9)], "p").await;
        cache.delete(&k).await;
        cache.clear().await;
        assert_eq!(cache.stats().await.size, 0);
    }
}
