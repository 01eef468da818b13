//! In-process store backend

use super::SharedStore;
use crate::error::CoordinatorResult;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct StoredValue {
    value: String,
    expires_at: Instant,
}

impl StoredValue {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Store backed by a `DashMap`; only shared by engines in the same process
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CoordinatorResult<bool> {
        // The entry guard holds the shard lock, so check-and-insert is atomic
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    Ok(false)
                } else {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> CoordinatorResult<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> CoordinatorResult<Option<String>> {
        Ok(self
            .entries
            .get(key)
            .filter(|v| v.is_live())
            .map(|v| v.value.clone()))
    }

    async fn remove(&self, key: &str) -> CoordinatorResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn remove_if(&self, key: &str, expected: &str) -> CoordinatorResult<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, v| v.is_live() && v.value == expected)
            .is_some())
    }

    fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| v.is_live());
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.put_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.put_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_replaceable() {
        let store = MemoryStore::new();

        store
            .put_if_absent("k", "a", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store
            .put_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());

        store.put("gone", "x", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_remove_if_checks_owner() {
        let store = MemoryStore::new();
        store.put("k", "owner-1", Duration::from_secs(10)).await.unwrap();

        assert!(!store.remove_if("k", "owner-2").await.unwrap());
        assert!(store.remove_if("k", "owner-1").await.unwrap());
        assert!(!store.remove_if("k", "owner-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_put_if_absent_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put_if_absent("lease", &i.to_string(), Duration::from_secs(10))
                    .await
                    .unwrap()
            }));
        }

        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }
}
