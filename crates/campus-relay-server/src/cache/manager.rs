//! Single entry point over whichever backend is active.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use super::backend::{CacheBackend, CacheError};
use crate::config::CacheConfig;
use crate::metrics;

/// Hex characters of the parameter digest kept in a key.
const DIGEST_LEN: usize = 16;

pub struct CacheManager {
    backend: RwLock<CacheBackend>,
    namespace: String,
    default_ttl: Duration,
    degraded: AtomicBool,
}

impl CacheManager {
    pub fn new(backend: CacheBackend, config: &CacheConfig) -> Self {
        Self {
            backend: RwLock::new(backend),
            namespace: config.namespace.clone(),
            default_ttl: config.default_ttl(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn local(config: &CacheConfig) -> Self {
        Self::new(CacheBackend::new_local(), config)
    }

    /// `local`, `redis`, or `degraded` once a never-reached Redis has been replaced.
    pub fn mode(&self) -> &'static str {
        if self.degraded.load(Ordering::Relaxed) {
            "degraded"
        } else {
            self.backend.read().mode()
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// `{namespace}:{prefix}:{digest}` where the digest covers the parameters
    /// sorted by name, so supply order never changes the key. Values are used
    /// verbatim.
    pub fn generate_key(&self, prefix: &str, params: &[(&str, &str)]) -> String {
        let sorted: BTreeMap<&str, &str> = params.iter().copied().collect();
        let serialized = serde_json::to_string(&sorted).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(serialized.as_bytes()));
        format!("{}:{}:{}", self.namespace, prefix, &digest[..DIGEST_LEN])
    }

    /// Absent on miss, on a backend failure and on an undecodable value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend().get(key).await {
            Ok(raw) => raw,
            Err(err) => {
                if self.on_error("get", key, &err) {
                    self.backend().get(key).await.ok().flatten()
                } else {
                    None
                }
            }
        };

        let backend_mode = self.backend.read().mode();
        match raw.map(|text| serde_json::from_str::<T>(&text)) {
            Some(Ok(value)) => {
                tracing::debug!(key = %key, "cache hit");
                metrics::record_cache_hit(backend_mode);
                Some(value)
            }
            Some(Err(err)) => {
                tracing::warn!(key = %key, error = %err, "cached value could not be decoded");
                metrics::record_cache_miss(backend_mode);
                None
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                metrics::record_cache_miss(backend_mode);
                None
            }
        }
    }

    /// Store `value` for `ttl`, or the configured default. Returns whether it was stored.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let data = match serde_json::to_string(value) {
            Ok(data) => data,
            Err(err) => {
                self.on_error("set", key, &CacheError::from(err));
                return false;
            }
        };
        let ttl = Some(ttl.unwrap_or(self.default_ttl));

        match self.backend().set(key, data.clone(), ttl).await {
            Ok(()) => true,
            Err(err) => {
                self.on_error("set", key, &err) && self.backend().set(key, data, ttl).await.is_ok()
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.backend().delete(key).await {
            Ok(removed) => removed,
            Err(err) => {
                self.on_error("delete", key, &err);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.backend().exists(key).await {
            Ok(found) => found,
            Err(err) => {
                self.on_error("exists", key, &err);
                false
            }
        }
    }

    pub async fn clear(&self) -> bool {
        match self.backend().clear().await {
            Ok(()) => true,
            Err(err) => {
                self.on_error("clear", "*", &err);
                false
            }
        }
    }

    /// Return the cached value, or run `factory`, cache its success and return it.
    ///
    /// Not single-flight: concurrent misses on one key each run `factory`.
    /// Errors from `factory` are returned and never cached.
    pub async fn get_or_populate<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }
        let value = factory().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    fn backend(&self) -> CacheBackend {
        self.backend.read().clone()
    }

    /// Log a failed call. Returns whether it should be retried on the (now
    /// local) backend.
    ///
    /// Only a Redis that has never been reached is replaced. Once Redis has
    /// answered, an unavailable call is a one-off miss and Redis stays.
    fn on_error(&self, op: &'static str, key: &str, err: &CacheError) -> bool {
        if !matches!(err, CacheError::Unavailable(_)) {
            tracing::warn!(op, key = %key, error = %err, "cache operation failed");
            return false;
        }

        let mut backend = self.backend.write();
        match &*backend {
            CacheBackend::Redis(redis) if redis.has_connected() => {
                metrics::record_cache_error(op);
                tracing::warn!(
                    op,
                    key = %key,
                    error = %err,
                    "Remote cache call failed, keeping Redis"
                );
                false
            }
            CacheBackend::Redis(_) => {
                *backend = CacheBackend::new_local();
                self.degraded.store(true, Ordering::Relaxed);
                metrics::record_cache_fallback();
                tracing::warn!(
                    op,
                    error = %err,
                    "Remote cache unreachable. Falling back to local cache."
                );
                true
            }
            // Replaced by a concurrent call.
            CacheBackend::Local(_) => true,
        }
    }
}
