//! Shared key/value store used for account leases and the nonce cache
//!
//! Every engine instance that talks to the same store sees the same leases, so
//! mutual exclusion holds across processes, not just within one.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// TTL-aware key/value store with an atomic create-if-absent
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Write `value` only when no live entry exists; returns whether it was written
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> CoordinatorResult<bool>;

    /// Unconditional write
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> CoordinatorResult<()>;

    async fn get(&self, key: &str) -> CoordinatorResult<Option<String>>;

    /// Unconditional delete; deleting a missing key is not an error
    async fn remove(&self, key: &str) -> CoordinatorResult<()>;

    /// Delete only if the live value equals `expected`; returns whether it was deleted
    async fn remove_if(&self, key: &str, expected: &str) -> CoordinatorResult<bool>;

    /// Drop expired entries the backend does not evict by itself; returns how many
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Build the configured store backend
pub async fn connect(config: &StoreConfig) -> CoordinatorResult<Arc<dyn SharedStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                CoordinatorError::Config("store.redis_url is required".to_string())
            })?;
            Ok(Arc::new(RedisStore::connect(url).await?))
        }
    }
}
