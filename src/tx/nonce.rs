//! Nonce sequencing for locked accounts
//!
//! The last nonce handed out per account is cached in the shared store for a
//! short time. The network's pending count lags behind freshly broadcast
//! transactions, so back-to-back submissions must not rely on it alone.
//! The cache is advisory: once it expires the network is asked again.

use crate::chain::NodeClient;
use crate::contracts::format_address;
use crate::error::CoordinatorResult;
use crate::store::SharedStore;

use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hands out nonces; callers must hold the account lock
pub struct NonceSequencer {
    store: Arc<dyn SharedStore>,
    client: Arc<dyn NodeClient>,
    namespace: String,
    ttl: Duration,
}

impl NonceSequencer {
    pub fn new(
        store: Arc<dyn SharedStore>,
        client: Arc<dyn NodeClient>,
        namespace: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            client,
            namespace: namespace.into(),
            ttl,
        }
    }

    /// Cache key for `address`, e.g. `ethereum-endpoint-0xabc...-nonce`
    pub fn key(&self, address: &Address) -> String {
        format!("{}-{}-nonce", self.namespace, format_address(address))
    }

    /// Next nonce: cached + 1, or the pending transaction count on a miss
    pub async fn next(&self, address: &Address) -> CoordinatorResult<u64> {
        let key = self.key(address);
        if let Some(cached) = self.store.get(&key).await? {
            match cached.parse::<u64>().ok().and_then(|last| last.checked_add(1)) {
                Some(nonce) => {
                    debug!("Nonce for {:?} from cache: {}", address, nonce);
                    return Ok(nonce);
                }
                None => warn!("Ignoring unusable cached nonce {:?} at {}", cached, key),
            }
        }

        let nonce = self.client.pending_transaction_count(*address).await?;
        debug!("Nonce for {:?} from network: {}", address, nonce);
        Ok(nonce)
    }

    /// Remember the nonce of a submitted transaction
    pub async fn record_submitted(&self, address: &Address, nonce: u64) -> CoordinatorResult<()> {
        self.store
            .put(&self.key(address), &nonce.to_string(), self.ttl)
            .await
    }

    /// Forget the cached nonce so the next call asks the network
    pub async fn purge(&self, address: &Address) -> CoordinatorResult<()> {
        debug!("Purging cached nonce for {:?}", address);
        self.store.remove(&self.key(address)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::FakeNode;
    use std::sync::atomic::Ordering;

    fn sequencer(node: Arc<FakeNode>, store: Arc<MemoryStore>) -> NonceSequencer {
        NonceSequencer::new(store, node, "ethereum-endpoint", Duration::from_secs(120))
    }

    fn address() -> Address {
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap()
    }

    #[tokio::test]
    async fn test_sequential_nonces_are_gapless() {
        let node = Arc::new(FakeNode::with_pending_count(5));
        let seq = sequencer(node.clone(), Arc::new(MemoryStore::new()));

        for expected in 5..10 {
            let nonce = seq.next(&address()).await.unwrap();
            assert_eq!(nonce, expected);
            seq.record_submitted(&address(), nonce).await.unwrap();
        }

        // Only the first call needed the network
        assert_eq!(node.count_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_purge_falls_back_to_network() {
        let node = Arc::new(FakeNode::with_pending_count(3));
        let store = Arc::new(MemoryStore::new());
        let seq = sequencer(node.clone(), store.clone());

        seq.record_submitted(&address(), 7).await.unwrap();
        assert_eq!(seq.next(&address()).await.unwrap(), 8);

        tokio_test::assert_ok!(seq.purge(&address()).await);
        assert_eq!(seq.next(&address()).await.unwrap(), 3);
        // Purging an absent entry is fine
        tokio_test::assert_ok!(seq.purge(&address()).await);
    }

    #[tokio::test]
    async fn test_key_format() {
        let seq = sequencer(Arc::new(FakeNode::default()), Arc::new(MemoryStore::new()));
        assert_eq!(
            seq.key(&address()),
            "ethereum-endpoint-0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed-nonce"
        );
    }

    #[tokio::test]
    async fn test_malformed_cache_is_ignored() {
        let node = Arc::new(FakeNode::with_pending_count(2));
        let store = Arc::new(MemoryStore::new());
        let seq = sequencer(node, store.clone());

        store
            .put(&seq.key(&address()), "not-a-number", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(seq.next(&address()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_cache_falls_back_to_network() {
        let node = Arc::new(FakeNode::with_pending_count(4));
        let store = Arc::new(MemoryStore::new());
        let seq = sequencer(node.clone(), store);

        seq.record_submitted(&address(), u64::MAX).await.unwrap();
        assert_eq!(seq.next(&address()).await.unwrap(), 4);
        assert_eq!(node.count_queries.load(Ordering::SeqCst), 1);
    }
}
