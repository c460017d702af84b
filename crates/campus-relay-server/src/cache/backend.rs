//! Cache backends: process-local DashMap or Redis.

use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached for this call.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache value could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() {
            CacheError::Unavailable(err.to_string())
        } else {
            CacheError::Backend(err.to_string())
        }
    }
}

/// A cached JSON document with an optional absolute expiry.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<str>,
    pub expires_at: Option<Instant>,
}

impl CachedEntry {
    pub fn new(data: String, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            data: Arc::from(data),
            // A TTL past the end of `Instant` never expires.
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        }
    }

    /// Visible iff no expiry was set or `now` is before it.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expiry| now >= expiry)
    }
}

/// In-process map. Expired entries linger until the next `get` sweeps them.
#[derive(Clone, Default)]
pub struct LocalCache {
    entries: Arc<DashMap<String, CachedEntry>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweeps every expired entry, then looks `key` up.
    ///
    /// The sweep walks the whole map. That is accepted at single-gateway scale.
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        let now = Instant::now();
        self.sweep_expired_at(now);
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| Arc::clone(&entry.data))
    }

    pub fn set(&self, key: &str, data: String, ttl: Option<Duration>) {
        self.entries
            .insert(key.to_string(), CachedEntry::new(data, ttl));
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Entries currently stored, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep_expired_at(&self, now: Instant) {
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
    }
}

/// Keys fetched per `SCAN` step and deleted per `DEL` in [`RedisCache::clear`].
const CLEAR_BATCH: usize = 500;

/// Redis with native TTLs. Values are stored as JSON text.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
    namespace: String,
    /// Set once any connection has been handed out. Shared between clones.
    connected: Arc<AtomicBool>,
}

impl RedisCache {
    pub fn new(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether Redis has been reached at least once.
    pub fn has_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub(super) fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, CacheError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        self.mark_connected();
        Ok(conn)
    }

    /// Take one connection from the pool and hand it back.
    pub async fn ping(&self) -> Result<(), CacheError> {
        self.connection().await.map(drop)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    pub async fn set(
        &self,
        key: &str,
        data: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(key, data, millis).await?;
            }
            None => conn.set::<_, _, ()>(key, data).await?,
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        Ok(conn.exists(key).await?)
    }

    /// Removes every key under this cache's namespace. Other keys are left alone.
    ///
    /// Walks the namespace with `SCAN` and deletes each batch as it arrives,
    /// so Redis is never blocked on the whole keyspace.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:*", self.namespace);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(CLEAR_BATCH)
                .query_async(&mut conn)
                .await?;
            for batch in keys.chunks(CLEAR_BATCH) {
                conn.del::<_, ()>(batch.to_vec()).await?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }
}

/// The two interchangeable stores behind [`CacheManager`](super::CacheManager).
#[derive(Clone)]
pub enum CacheBackend {
    Local(LocalCache),
    Redis(RedisCache),
}

impl CacheBackend {
    pub fn new_local() -> Self {
        CacheBackend::Local(LocalCache::new())
    }

    pub fn new_redis(pool: Pool, namespace: impl Into<String>) -> Self {
        CacheBackend::Redis(RedisCache::new(pool, namespace))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            CacheBackend::Local(_) => "local",
            CacheBackend::Redis(_) => "redis",
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self {
            CacheBackend::Local(local) => Ok(local.get(key).map(|data| data.to_string())),
            CacheBackend::Redis(redis) => redis.get(key).await,
        }
    }

    pub async fn set(
        &self,
        key: &str,
        data: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        match self {
            CacheBackend::Local(local) => {
                local.set(key, data, ttl);
                Ok(())
            }
            CacheBackend::Redis(redis) => redis.set(key, data, ttl).await,
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        match self {
            CacheBackend::Local(local) => Ok(local.delete(key)),
            CacheBackend::Redis(redis) => redis.delete(key).await,
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        match self {
            CacheBackend::Local(local) => Ok(local.exists(key)),
            CacheBackend::Redis(redis) => redis.exists(key).await,
        }
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        match self {
            CacheBackend::Local(local) => {
                local.clear();
                Ok(())
            }
            CacheBackend::Redis(redis) => redis.clear().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_without_ttl_never_expires() {
        let entry = CachedEntry::new("{}".into(), None);
        assert!(!entry.is_expired_at(Instant::now() + Duration::from_secs(86_400)));
    }

    #[test]
    fn entry_expires_exactly_at_deadline() {
        let entry = CachedEntry::new("{}".into(), Some(Duration::from_secs(5)));
        let expiry = entry.expires_at.unwrap();
        assert!(!entry.is_expired_at(expiry - Duration::from_millis(1)));
        assert!(entry.is_expired_at(expiry));
    }

    #[test]
    fn oversized_ttl_never_expires() {
        let entry = CachedEntry::new("{}".into(), Some(Duration::MAX));
        assert_eq!(entry.expires_at, None);
        assert!(!entry.is_expired_at(Instant::now()));
    }

    #[tokio::test]
    async fn failed_ping_leaves_redis_unconnected() {
        let mut config = deadpool_redis::Config::from_url("redis://127.0.0.1:1");
        let mut limits = deadpool_redis::PoolConfig::new(1);
        limits.timeouts.wait = Some(Duration::from_millis(200));
        limits.timeouts.create = Some(Duration::from_millis(200));
        config.pool = Some(limits);
        let pool = config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();

        let redis = RedisCache::new(pool, "campus-relay");
        assert!(matches!(redis.ping().await, Err(CacheError::Unavailable(_))));
        assert!(!redis.has_connected());
        assert!(!redis.clone().has_connected());
    }

    #[test]
    fn local_get_sweeps_other_expired_entries() {
        let cache = LocalCache::new();
        cache.set("stale", "1".into(), Some(Duration::ZERO));
        cache.set("fresh", "2".into(), Some(Duration::from_secs(60)));
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.get("fresh").as_deref(), Some("2"));
        assert_eq!(cache.len(), 1);
        assert!(!cache.exists("stale"));
    }

    #[test]
    fn local_backend_operations() {
        tokio_test::block_on(async {
            let backend = CacheBackend::new_local();
            assert_eq!(backend.mode(), "local");

            backend.set("k", "\"v\"".into(), None).await.unwrap();
            assert!(backend.exists("k").await.unwrap());
            assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("\"v\""));

            assert!(backend.delete("k").await.unwrap());
            assert!(!backend.delete("k").await.unwrap());

            backend.set("a", "1".into(), None).await.unwrap();
            backend.clear().await.unwrap();
            assert_eq!(backend.get("a").await.unwrap(), None);
        });
    }
}
