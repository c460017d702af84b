pub mod admission;
pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod feedback;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod portal;
pub mod server;
pub mod session;

pub use admission::{AdmissionController, AdmissionDecision};
pub use aggregate::{Aggregate, AggregateSource, AggregationOrchestrator, OrchestratorSettings};
pub use cache::{CacheBackend, CacheManager, CachedEntry};
pub use crate::config::{AppConfig, CacheConfig, RateLimitConfig, RedisConfig, ServerConfig};
pub use error::ApiError;
pub use observability::init_tracing;
pub use server::{AppState, RelayServer, ServerBuilder, build_app};

/// Create a cache backend based on configuration.
///
/// - **No Redis url**: local-only cache (DashMap)
/// - **Redis url set**: connects to Redis, falls back to local when the pool
///   cannot be built or the first connection fails
///
/// The gateway always starts; a missing Redis only costs shared caching.
pub async fn create_cache_backend(config: &RedisConfig, namespace: &str) -> CacheBackend {
    use std::time::Duration;

    let Some(url) = config.url.as_deref().filter(|url| !url.is_empty()) else {
        tracing::info!("Redis not configured, using local cache only");
        return CacheBackend::new_local();
    };

    tracing::info!("Connecting to Redis");

    let timeout = Duration::from_millis(config.timeout_ms);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let mut redis_config = deadpool_redis::Config::from_url(url);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return CacheBackend::new_local();
        }
    };

    // Test connection; a Redis reached here is kept through later blips
    let redis = cache::RedisCache::new(pool, namespace);
    match redis.ping().await {
        Ok(()) => {
            tracing::info!("Connected to Redis");
            CacheBackend::Redis(redis)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            CacheBackend::new_local()
        }
    }
}
