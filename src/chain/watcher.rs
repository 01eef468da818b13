//! Confirmation tracking for submitted transactions
//!
//! A transaction counts as confirmed once its receipt is at least `blocks`
//! deep. Before reporting, the receipt is fetched again and must still sit in
//! the same block; if it moved or vanished the watcher keeps waiting.

use super::NodeClient;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use ethers::types::{TransactionReceipt, H256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long and how deep to wait for a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub blocks: u64,
    pub timeout: Duration,
}

/// Terminal result of watching a transaction
#[derive(Debug)]
pub enum WatchOutcome {
    Confirmed(TransactionReceipt),
    Rejected(CoordinatorError),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfirmationWatcher: Send + Sync {
    /// Wait until `tx_hash` is confirmed or the policy gives up
    async fn watch(&self, tx_hash: H256, policy: ConfirmationPolicy) -> WatchOutcome;
}

/// Watcher that polls the node for receipts
pub struct ReceiptPoller {
    client: Arc<dyn NodeClient>,
    poll_interval: Duration,
}

impl ReceiptPoller {
    pub fn new(client: Arc<dyn NodeClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// One polling round; `Some` once the receipt is deep enough and still included
    async fn poll_once(
        &self,
        tx_hash: H256,
        blocks: u64,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        let receipt = match self.client.transaction_receipt(tx_hash).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let included_at = match receipt.block_number {
            Some(n) => n.as_u64(),
            None => return Ok(None),
        };

        let current = self.client.block_number().await?;
        let confirmations = current.saturating_sub(included_at);
        if confirmations < blocks {
            debug!(
                "Transaction {:?} has {} / {} confirmations",
                tx_hash, confirmations, blocks
            );
            return Ok(None);
        }

        // Reorg guard
        match self.client.transaction_receipt(tx_hash).await? {
            Some(again) if again.block_hash == receipt.block_hash => Ok(Some(again)),
            _ => {
                warn!(
                    "Transaction {:?} left block {} before confirmation, waiting again",
                    tx_hash, included_at
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ConfirmationWatcher for ReceiptPoller {
    async fn watch(&self, tx_hash: H256, policy: ConfirmationPolicy) -> WatchOutcome {
        let wait = async {
            loop {
                match self.poll_once(tx_hash, policy.blocks).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => warn!("Receipt poll for {:?} failed: {}", tx_hash, e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(policy.timeout, wait).await {
            Ok(receipt) => {
                if receipt.status == Some(0.into()) {
                    warn!("Transaction {:?} was mined but reverted", tx_hash);
                }
                info!(
                    "Transaction {:?} confirmed in block {:?}",
                    tx_hash, receipt.block_number
                );
                WatchOutcome::Confirmed(receipt)
            }
            Err(_) => {
                // Rounded to the nearest minute for the caller-facing message
                let minutes = (policy.timeout.as_secs() + 30) / 60;
                warn!(
                    "Transaction {:?} not confirmed after {:?}",
                    tx_hash, policy.timeout
                );
                WatchOutcome::Rejected(CoordinatorError::ConfirmationTimeout { minutes })
            }
        }
    }
}
