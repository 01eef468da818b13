//! In-memory node used by unit tests

use crate::chain::NodeClient;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use ethers::types::{
    Address, Block, Bytes, Log, TransactionReceipt, TransactionRequest, H256, U256, U64,
};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scriptable `NodeClient`; broadcasts are mined instantly when `auto_mine` is set
pub struct FakeNode {
    pub chain_id: u64,
    pub pending_count: AtomicU64,
    pub head: AtomicU64,
    pub gas_estimate: U256,
    pub gas_price: U256,
    pub fail_estimate: AtomicBool,
    pub fail_broadcast: AtomicBool,
    pub auto_mine: AtomicBool,
    pub call_result: Mutex<Bytes>,
    pub sent: Mutex<Vec<Bytes>>,
    pub receipts: Mutex<HashMap<H256, TransactionReceipt>>,
    pub count_queries: AtomicUsize,
    /// Pause after a broadcast is accepted, before it is acknowledged
    pub broadcast_delay_ms: AtomicU64,
    pub blocks: Mutex<HashMap<H256, Block<H256>>>,
    pub latest: Mutex<Option<H256>>,
    pub logs: Mutex<HashMap<H256, Vec<Log>>>,
}

impl Default for FakeNode {
    fn default() -> Self {
        Self {
            chain_id: 1337,
            pending_count: AtomicU64::new(0),
            head: AtomicU64::new(100),
            gas_estimate: U256::from(21_000),
            gas_price: U256::from(1_000_000_000u64),
            fail_estimate: AtomicBool::new(false),
            fail_broadcast: AtomicBool::new(false),
            auto_mine: AtomicBool::new(true),
            call_result: Mutex::new(Bytes::default()),
            sent: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            count_queries: AtomicUsize::new(0),
            broadcast_delay_ms: AtomicU64::new(0),
            blocks: Mutex::new(HashMap::new()),
            latest: Mutex::new(None),
            logs: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeNode {
    pub fn with_pending_count(count: u64) -> Self {
        let node = Self::default();
        node.pending_count.store(count, Ordering::SeqCst);
        node
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Place a receipt for `hash` at `block`
    pub fn mine(&self, hash: H256, block: u64, contract_address: Option<Address>) {
        let receipt = TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(U64::from(block)),
            block_hash: Some(H256::from_low_u64_be(block)),
            status: Some(U64::from(1)),
            contract_address,
            ..Default::default()
        };
        self.receipts.lock().unwrap().insert(hash, receipt);
    }

    /// Make block `hash` on top of `parent` the new head
    pub fn push_block(&self, number: u64, hash: H256, parent: H256) {
        let block = Block {
            number: Some(U64::from(number)),
            hash: Some(hash),
            parent_hash: parent,
            ..Default::default()
        };
        self.blocks.lock().unwrap().insert(hash, block);
        *self.latest.lock().unwrap() = Some(hash);
    }

    pub fn add_log(&self, block_hash: H256, log: Log) {
        self.logs.lock().unwrap().entry(block_hash).or_default().push(log);
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn chain_id(&self) -> CoordinatorResult<u64> {
        Ok(self.chain_id)
    }

    async fn pending_transaction_count(&self, _address: Address) -> CoordinatorResult<u64> {
        self.count_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.pending_count.load(Ordering::SeqCst))
    }

    async fn estimate_gas(&self, _tx: &TransactionRequest) -> CoordinatorResult<U256> {
        if self.fail_estimate.load(Ordering::SeqCst) {
            return Err(CoordinatorError::GasEstimation(
                "execution reverted".to_string(),
            ));
        }
        Ok(self.gas_estimate)
    }

    async fn gas_price(&self) -> CoordinatorResult<U256> {
        Ok(self.gas_price)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Broadcast("connection refused".to_string()));
        }
        let hash = H256::from(keccak256(&raw));
        self.sent.lock().unwrap().push(raw);
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.broadcast_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.auto_mine.load(Ordering::SeqCst) {
            let block = self.head.load(Ordering::SeqCst);
            self.mine(hash, block, None);
        }
        Ok(hash)
    }

    async fn call(&self, _tx: &TransactionRequest) -> CoordinatorResult<Bytes> {
        Ok(self.call_result.lock().unwrap().clone())
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn block_number(&self) -> CoordinatorResult<u64> {
        // Every poll sees one more block
        Ok(self.head.fetch_add(1, Ordering::SeqCst))
    }

    async fn latest_block(&self) -> CoordinatorResult<Option<Block<H256>>> {
        let latest = *self.latest.lock().unwrap();
        Ok(latest.and_then(|hash| self.blocks.lock().unwrap().get(&hash).cloned()))
    }

    async fn block_by_hash(&self, hash: H256) -> CoordinatorResult<Option<Block<H256>>> {
        Ok(self.blocks.lock().unwrap().get(&hash).cloned())
    }

    async fn block_logs(
        &self,
        block_hash: H256,
        addresses: Vec<Address>,
    ) -> CoordinatorResult<Vec<Log>> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .get(&block_hash)
            .map(|logs| {
                logs.iter()
                    .filter(|log| addresses.contains(&log.address))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
