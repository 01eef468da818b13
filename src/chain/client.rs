//! Firewalled JSON-RPC client for the EVM node

use super::firewall;
use crate::config::NetworkConfig;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use ethers::types::{
    Address, Block, Bytes, Filter, Log, TransactionReceipt, TransactionRequest, ValueOrArray, H256,
    U256, U64,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Node operations the engine and watcher depend on
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Chain id used for replay protection when signing
    async fn chain_id(&self) -> CoordinatorResult<u64>;

    /// `eth_getTransactionCount(address, "pending")`
    async fn pending_transaction_count(&self, address: Address) -> CoordinatorResult<u64>;

    async fn estimate_gas(&self, tx: &TransactionRequest) -> CoordinatorResult<U256>;

    async fn gas_price(&self) -> CoordinatorResult<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256>;

    /// Read-only `eth_call` against the latest block
    async fn call(&self, tx: &TransactionRequest) -> CoordinatorResult<Bytes>;

    async fn transaction_receipt(&self, hash: H256)
        -> CoordinatorResult<Option<TransactionReceipt>>;

    async fn block_number(&self) -> CoordinatorResult<u64>;

    /// Head block, without transaction bodies
    async fn latest_block(&self) -> CoordinatorResult<Option<Block<H256>>>;

    async fn block_by_hash(&self, hash: H256) -> CoordinatorResult<Option<Block<H256>>>;

    /// Logs of one block emitted by any of `addresses`
    async fn block_logs(&self, block_hash: H256, addresses: Vec<Address>)
        -> CoordinatorResult<Vec<Log>>;
}

/// HTTP JSON-RPC client; every request passes the firewall first
pub struct RpcClient {
    provider: Provider<Http>,
    url: String,
    chain_id_override: Option<u64>,
    chain_id: OnceCell<u64>,
}

impl RpcClient {
    /// Create a client for the configured node
    pub fn new(config: &NetworkConfig) -> CoordinatorResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| CoordinatorError::Config(format!("Invalid rpc_url: {}", e)))?
            .interval(Duration::from_millis(100));

        info!("RPC client configured for {}", config.rpc_url);
        Ok(Self {
            provider,
            url: config.rpc_url.clone(),
            chain_id_override: config.chain_id,
            chain_id: OnceCell::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a JSON-RPC request; methods outside the allow-list never reach the wire
    pub async fn request<T, R>(&self, method: &str, params: T) -> CoordinatorResult<R>
    where
        T: Debug + Serialize + Send + Sync,
        R: Serialize + DeserializeOwned + Debug + Send,
    {
        firewall::check(method)?;
        debug!("RPC {} {:?}", method, params);

        self.provider
            .request(method, params)
            .await
            .map_err(|e| CoordinatorError::Rpc {
                method: method.to_string(),
                message: e.to_string(),
            })
    }

    /// Generic stub for a row of the RPC table, e.g. `("eth", "getBalance")`
    ///
    /// Absent trailing params are dropped so the node applies its own defaults.
    pub async fn call_method(
        &self,
        namespace: &str,
        method: &str,
        params: Vec<Option<Value>>,
    ) -> CoordinatorResult<Value> {
        let row = firewall::lookup(namespace, method).ok_or_else(|| {
            CoordinatorError::Forbidden(format!("{}.{}", namespace, method))
        })?;

        if params.len() > row.params.len() {
            return Err(CoordinatorError::InvalidInput(format!(
                "{} takes at most {} params ({})",
                row.rpc,
                row.params.len(),
                row.params.join(", ")
            )));
        }

        let params: Vec<Value> = params.into_iter().flatten().collect();
        self.request(row.rpc, params).await
    }

    /// Forward a raw JSON-RPC body `{"method": ..., "params": [...]}`
    pub async fn post(&self, body: Value) -> CoordinatorResult<Value> {
        let method = body
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| CoordinatorError::Forbidden("undefined".to_string()))?;
        let params = match body.get("params") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };

        self.request(method, params).await
    }
}

#[async_trait]
impl NodeClient for RpcClient {
    async fn chain_id(&self) -> CoordinatorResult<u64> {
        if let Some(id) = self.chain_id_override {
            return Ok(id);
        }

        self.chain_id
            .get_or_try_init(|| async {
                let version: String = self.request("net_version", ()).await?;
                let id = version.trim().parse::<u64>().map_err(|e| CoordinatorError::Rpc {
                    method: "net_version".to_string(),
                    message: format!("unexpected network id {}: {}", version, e),
                })?;
                info!("Connected to network {}", id);
                Ok::<_, CoordinatorError>(id)
            })
            .await
            .copied()
    }

    async fn pending_transaction_count(&self, address: Address) -> CoordinatorResult<u64> {
        let count: U256 = self
            .request("eth_getTransactionCount", (address, "pending"))
            .await?;
        Ok(count.low_u64())
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> CoordinatorResult<U256> {
        self.request("eth_estimateGas", [tx])
            .await
            .map_err(|e| CoordinatorError::GasEstimation(e.to_string()))
    }

    async fn gas_price(&self) -> CoordinatorResult<U256> {
        self.request("eth_gasPrice", ())
            .await
            .map_err(|e| CoordinatorError::GasEstimation(format!("gas price unavailable: {}", e)))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256> {
        self.request("eth_sendRawTransaction", [raw])
            .await
            .map_err(|e| {
                warn!("Broadcast failed: {}", e);
                CoordinatorError::Broadcast(e.to_string())
            })
    }

    async fn call(&self, tx: &TransactionRequest) -> CoordinatorResult<Bytes> {
        self.request("eth_call", (tx, "latest")).await
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        self.request("eth_getTransactionReceipt", [hash]).await
    }

    async fn block_number(&self) -> CoordinatorResult<u64> {
        let number: U64 = self.request("eth_blockNumber", ()).await?;
        Ok(number.as_u64())
    }

    async fn latest_block(&self) -> CoordinatorResult<Option<Block<H256>>> {
        self.request("eth_getBlockByNumber", ("latest", false)).await
    }

    async fn block_by_hash(&self, hash: H256) -> CoordinatorResult<Option<Block<H256>>> {
        self.request("eth_getBlockByHash", (hash, false)).await
    }

    async fn block_logs(
        &self,
        block_hash: H256,
        addresses: Vec<Address>,
    ) -> CoordinatorResult<Vec<Log>> {
        let filter = Filter::new()
            .at_block_hash(block_hash)
            .address(ValueOrArray::Array(addresses));

        // eth_getLogs stays off the proxy allow-list; only the event follower reads logs
        self.provider
            .request("eth_getLogs", [filter])
            .await
            .map_err(|e| CoordinatorError::Rpc {
                method: "eth_getLogs".to_string(),
                message: e.to_string(),
            })
    }
}
