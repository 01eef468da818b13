//! Gas limit and gas price filling for locally signed transactions

use crate::chain::NodeClient;
use crate::error::CoordinatorResult;

use ethers::types::TransactionRequest;
use std::sync::Arc;
use tracing::debug;

/// Fills in whatever gas fields the caller left empty
pub struct GasFiller {
    client: Arc<dyn NodeClient>,
}

impl GasFiller {
    pub fn new(client: Arc<dyn NodeClient>) -> Self {
        Self { client }
    }

    /// Estimate `gas` and look up `gas_price` when absent
    ///
    /// Either lookup failing surfaces as `GasEstimation`.
    pub async fn fill(&self, tx: &mut TransactionRequest) -> CoordinatorResult<()> {
        if tx.gas.is_none() {
            let gas = self.client.estimate_gas(tx).await?;
            debug!("Estimated gas: {}", gas);
            tx.gas = Some(gas);
        }

        if tx.gas_price.is_none() {
            let price = self.client.gas_price().await?;
            debug!("Gas price: {}", price);
            tx.gas_price = Some(price);
        }

        Ok(())
    }
}
