//! Redis store backend, shared by every engine instance pointed at the same server

use super::SharedStore;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

fn store_error(e: redis::RedisError) -> CoordinatorError {
    CoordinatorError::Store(e.to_string())
}

/// Store backed by Redis `SET NX PX`
pub struct RedisStore {
    conn: ConnectionManager,
    compare_and_delete: redis::Script,
}

impl RedisStore {
    /// Connect to the given Redis URL
    pub async fn connect(url: &str) -> CoordinatorResult<Self> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        info!("Connected to shared store at {}", url);

        Ok(Self {
            conn,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CoordinatorResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        debug!("SET NX {} -> {:?}", key, reply);
        Ok(reply.is_some())
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> CoordinatorResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn get(&self, key: &str) -> CoordinatorResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_error)
    }

    async fn remove(&self, key: &str) -> CoordinatorResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(store_error)
    }

    async fn remove_if(&self, key: &str, expected: &str) -> CoordinatorResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testcontainers::clients::Cli;
    use testcontainers::core::WaitFor;
    use testcontainers::GenericImage;

    fn redis_image() -> GenericImage {
        GenericImage::new("redis", "7-alpine")
            .with_exposed_port(6379)
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
    }

    #[tokio::test]
    #[ignore = "needs a docker daemon"]
    async fn test_redis_store_semantics() {
        let docker = Cli::default();
        let node = docker.run(redis_image());
        let url = format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379));
        let store = RedisStore::connect(&url).await.unwrap();
        let ttl = Duration::from_secs(10);

        // Only the first writer gets the lease
        assert!(store.put_if_absent("lease", "owner-1", ttl).await.unwrap());
        assert!(!store.put_if_absent("lease", "owner-2", ttl).await.unwrap());
        assert_eq!(store.get("lease").await.unwrap().as_deref(), Some("owner-1"));

        // Release is owner-checked
        assert!(!store.remove_if("lease", "owner-2").await.unwrap());
        assert!(store.remove_if("lease", "owner-1").await.unwrap());
        assert!(!store.remove_if("lease", "owner-1").await.unwrap());
        assert_eq!(store.get("lease").await.unwrap(), None);

        // Entries expire on their own
        store.put("nonce", "7", Duration::from_millis(50)).await.unwrap();
        assert!(!store.put_if_absent("nonce", "8", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("nonce").await.unwrap(), None);
        assert!(store.put_if_absent("nonce", "8", ttl).await.unwrap());

        store.remove("nonce").await.unwrap();
        store.remove("nonce").await.unwrap();
        assert_eq!(store.get("nonce").await.unwrap(), None);
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    #[ignore = "needs a docker daemon"]
    async fn test_two_connections_share_one_lease() {
        let docker = Cli::default();
        let node = docker.run(redis_image());
        let url = format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379));
        let a = RedisStore::connect(&url).await.unwrap();
        let b = RedisStore::connect(&url).await.unwrap();
        let ttl = Duration::from_secs(10);

        assert!(a.put_if_absent("lease", "a", ttl).await.unwrap());
        assert!(!b.put_if_absent("lease", "b", ttl).await.unwrap());
        assert!(!b.remove_if("lease", "b").await.unwrap());
        assert!(a.remove_if("lease", "a").await.unwrap());
        assert!(b.put_if_absent("lease", "b", ttl).await.unwrap());
    }

    #[test]
    fn test_ttl_is_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
