//! Response caching with a local map and an optional Redis backend.
//!
//! ```text
//! handler → CacheManager → CacheBackend::Redis ──(unreachable)──▶ CacheBackend::Local
//! ```
//!
//! A cache failure never fails a request: reads degrade to misses. A Redis
//! that was never reached is replaced by the local map for the rest of the
//! process lifetime; once reached, Redis is kept and individual failed calls
//! count as misses.

pub mod backend;
pub mod manager;

pub use backend::{CacheBackend, CacheError, CachedEntry, LocalCache, RedisCache};
pub use manager::CacheManager;
