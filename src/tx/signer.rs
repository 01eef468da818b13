//! Signing strategies and the dispatcher that routes transactions to them
//!
//! - `Managed`: gas is filled in, the transaction is signed with a key from
//!   the key ring and broadcast right away.
//! - `External`: the unsigned transaction is handed to an out-of-process
//!   signer (a wallet, an operator) that later approves, declines or fails it.

use super::gas::GasFiller;
use super::keyring::KeyRing;
use crate::chain::NodeClient;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, H256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningStrategy {
    External,
    Managed,
}

impl SigningStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningStrategy::External => "external",
            SigningStrategy::Managed => "managed",
        }
    }
}

/// Unsigned transaction awaiting an external signature
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRequest {
    pub request_id: Uuid,
    pub chain_id: u64,
    pub from: Address,
    pub nonce: Option<u64>,
    pub transaction: TransactionRequest,
}

/// What the external signer decided
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SignerOutcome {
    /// Signed and broadcast by the signer
    Approved {
        #[serde(rename = "txHash")]
        tx_hash: H256,
    },
    Declined,
    Failed { reason: String },
}

/// One-shot answer channel handed to the signer with each request
#[derive(Debug)]
pub struct SignerReply {
    tx: oneshot::Sender<SignerOutcome>,
}

impl SignerReply {
    pub fn channel() -> (Self, oneshot::Receiver<SignerOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver the outcome; returns false if nobody is waiting anymore
    pub fn send(self, outcome: SignerOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }

    pub fn approve(self, tx_hash: H256) -> bool {
        self.send(SignerOutcome::Approved { tx_hash })
    }

    pub fn decline(self) -> bool {
        self.send(SignerOutcome::Declined)
    }

    pub fn fail(self, reason: impl Into<String>) -> bool {
        self.send(SignerOutcome::Failed {
            reason: reason.into(),
        })
    }
}

/// Out-of-process signer
///
/// `submit` hands the request off and returns without waiting for a decision.
/// Dropping `reply` without answering counts as a failure. `cancel` withdraws
/// a request the engine stopped waiting on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalSigner: Send + Sync {
    async fn submit(&self, request: SignatureRequest, reply: SignerReply) -> CoordinatorResult<()>;

    async fn cancel(&self, request_id: Uuid);
}

/// Signer that parks requests until an operator resolves them
#[derive(Default)]
pub struct QueueSigner {
    pending: DashMap<Uuid, (SignatureRequest, SignerReply)>,
}

impl QueueSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests still waiting for a decision, oldest first is not guaranteed
    pub fn pending(&self) -> Vec<SignatureRequest> {
        self.pending.iter().map(|e| e.value().0.clone()).collect()
    }

    /// Answer a parked request
    pub fn resolve(&self, request_id: &Uuid, outcome: SignerOutcome) -> CoordinatorResult<()> {
        let (_, (request, reply)) = self.pending.remove(request_id).ok_or_else(|| {
            CoordinatorError::NotFound(format!("Signature request [{}]", request_id))
        })?;
        crate::metrics::set_pending_signatures(self.pending.len());

        info!(
            "Signature request {} for {:?} resolved: {:?}",
            request_id, request.from, outcome
        );
        if !reply.send(outcome) {
            warn!("Nobody was waiting on signature request {}", request_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalSigner for QueueSigner {
    async fn submit(&self, request: SignatureRequest, reply: SignerReply) -> CoordinatorResult<()> {
        debug!("Queued signature request {}", request.request_id);
        self.pending.insert(request.request_id, (request, reply));
        crate::metrics::set_pending_signatures(self.pending.len());
        Ok(())
    }

    async fn cancel(&self, request_id: Uuid) {
        if self.pending.remove(&request_id).is_some() {
            crate::metrics::set_pending_signatures(self.pending.len());
            info!("Signature request {} withdrawn", request_id);
        }
    }
}

/// Result of handing a transaction to a signing strategy
#[derive(Debug)]
pub enum Dispatch {
    /// Signed locally and accepted by the node
    Broadcast(H256),
    /// Waiting on the external signer
    AwaitingSigner(oneshot::Receiver<SignerOutcome>),
}

/// Routes transactions to the requested signing strategy
pub struct SigningDispatcher {
    client: Arc<dyn NodeClient>,
    keyring: Arc<KeyRing>,
    gas: GasFiller,
    external: Option<Arc<dyn ExternalSigner>>,
}

impl SigningDispatcher {
    pub fn new(
        client: Arc<dyn NodeClient>,
        keyring: Arc<KeyRing>,
        external: Option<Arc<dyn ExternalSigner>>,
    ) -> Self {
        Self {
            gas: GasFiller::new(client.clone()),
            client,
            keyring,
            external,
        }
    }

    pub fn supports(&self, strategy: SigningStrategy) -> bool {
        match strategy {
            SigningStrategy::Managed => true,
            SigningStrategy::External => self.external.is_some(),
        }
    }

    /// Withdraw an external request nobody waits on anymore
    pub async fn cancel(&self, request_id: Uuid) {
        if let Some(signer) = &self.external {
            signer.cancel(request_id).await;
        }
    }

    /// Hand `tx` to the strategy; `tx.from` must be set
    pub async fn dispatch(
        &self,
        request_id: Uuid,
        tx: TransactionRequest,
        strategy: SigningStrategy,
    ) -> CoordinatorResult<Dispatch> {
        let from = tx
            .from
            .ok_or_else(|| CoordinatorError::InvalidInput("From address must be provided".into()))?;
        let chain_id = self.client.chain_id().await?;
        let tx = tx.chain_id(chain_id);

        match strategy {
            SigningStrategy::Managed => self.sign_and_send(from, chain_id, tx).await.map(Dispatch::Broadcast),
            SigningStrategy::External => {
                let signer = self.external.as_ref().ok_or_else(|| {
                    CoordinatorError::Config("No external signer configured".into())
                })?;
                let (reply, outcome) = SignerReply::channel();
                let nonce = tx.nonce.map(|n| n.low_u64());
                signer
                    .submit(
                        SignatureRequest {
                            request_id,
                            chain_id,
                            from,
                            nonce,
                            transaction: tx,
                        },
                        reply,
                    )
                    .await?;
                Ok(Dispatch::AwaitingSigner(outcome))
            }
        }
    }

    async fn sign_and_send(
        &self,
        from: Address,
        chain_id: u64,
        mut tx: TransactionRequest,
    ) -> CoordinatorResult<H256> {
        self.gas.fill(&mut tx).await?;

        let wallet = self.keyring.wallet(&from)?.with_chain_id(chain_id);
        let typed: TypedTransaction = tx.into();
        let signature = wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| CoordinatorError::Signing(e.to_string()))?;
        let raw = typed.rlp_signed(&signature);

        let tx_hash = self.client.send_raw_transaction(raw).await?;
        debug!("Broadcast {:?} from {:?}", tx_hash, from);
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNode;
    use std::sync::atomic::Ordering;

    const KEY: &str = "f0786b43f1305389c7a60dabaf6b57ac16b1a254f8e7026513be4f82ec90d946";

    fn managed_setup(node: Arc<FakeNode>) -> (SigningDispatcher, Address) {
        let keyring = Arc::new(KeyRing::new());
        let from = keyring.import_account(KEY).unwrap().parse().unwrap();
        (SigningDispatcher::new(node, keyring, None), from)
    }

    #[tokio::test]
    async fn test_managed_signs_and_broadcasts() {
        let node = Arc::new(FakeNode::default());
        let (dispatcher, from) = managed_setup(node.clone());

        let tx = TransactionRequest::new().from(from).to(Address::repeat_byte(1)).nonce(0u64);
        match dispatcher.dispatch(Uuid::new_v4(), tx, SigningStrategy::Managed).await.unwrap() {
            Dispatch::Broadcast(hash) => assert_ne!(hash, H256::zero()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(node.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_managed_failures_are_typed() {
        let node = Arc::new(FakeNode::default());
        let (dispatcher, from) = managed_setup(node.clone());
        let tx = TransactionRequest::new().from(from).to(Address::repeat_byte(1)).nonce(0u64);

        node.fail_estimate.store(true, Ordering::SeqCst);
        let err = dispatcher
            .dispatch(Uuid::new_v4(), tx.clone(), SigningStrategy::Managed)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "gasEstimationFail");

        node.fail_estimate.store(false, Ordering::SeqCst);
        node.fail_broadcast.store(true, Ordering::SeqCst);
        let err = dispatcher
            .dispatch(Uuid::new_v4(), tx, SigningStrategy::Managed)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalidNetwork");

        let stranger = TransactionRequest::new().from(Address::repeat_byte(7)).nonce(0u64);
        node.fail_broadcast.store(false, Ordering::SeqCst);
        let err = dispatcher
            .dispatch(Uuid::new_v4(), stranger, SigningStrategy::Managed)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalidAccount");
        assert_eq!(node.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_external_hand_off_is_tagged_with_chain_id() {
        let mut signer = MockExternalSigner::new();
        signer
            .expect_submit()
            .withf(|request, _| request.chain_id == 1337 && request.nonce == Some(4))
            .times(1)
            .returning(|_, reply| {
                reply.approve(H256::repeat_byte(9));
                Ok(())
            });

        let node = Arc::new(FakeNode::default());
        let dispatcher =
            SigningDispatcher::new(node.clone(), Arc::new(KeyRing::new()), Some(Arc::new(signer)));
        let tx = TransactionRequest::new().from(Address::repeat_byte(1)).nonce(4u64);

        match dispatcher.dispatch(Uuid::new_v4(), tx, SigningStrategy::External).await.unwrap() {
            Dispatch::AwaitingSigner(rx) => assert_eq!(
                rx.await.unwrap(),
                SignerOutcome::Approved {
                    tx_hash: H256::repeat_byte(9)
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(node.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_signer_resolves_parked_requests() {
        let queue = QueueSigner::new();
        let (reply, rx) = SignerReply::channel();
        let request_id = Uuid::new_v4();

        queue
            .submit(
                SignatureRequest {
                    request_id,
                    chain_id: 1,
                    from: Address::zero(),
                    nonce: Some(0),
                    transaction: TransactionRequest::new(),
                },
                reply,
            )
            .await
            .unwrap();
        assert_eq!(queue.pending().len(), 1);

        queue.resolve(&request_id, SignerOutcome::Declined).unwrap();
        assert_eq!(rx.await.unwrap(), SignerOutcome::Declined);
        assert!(queue.pending().is_empty());
        assert!(queue.resolve(&request_id, SignerOutcome::Declined).is_err());
    }

    #[tokio::test]
    async fn test_cancel_withdraws_parked_request() {
        let queue = Arc::new(QueueSigner::new());
        let (reply, rx) = SignerReply::channel();
        let request_id = Uuid::new_v4();
        queue
            .submit(
                SignatureRequest {
                    request_id,
                    chain_id: 1,
                    from: Address::zero(),
                    nonce: Some(0),
                    transaction: TransactionRequest::new(),
                },
                reply,
            )
            .await
            .unwrap();

        let dispatcher =
            SigningDispatcher::new(Arc::new(FakeNode::default()), Arc::new(KeyRing::new()), Some(queue.clone()));
        dispatcher.cancel(request_id).await;

        assert!(queue.pending().is_empty());
        assert!(rx.await.is_err());
        assert_eq!(
            queue.resolve(&request_id, SignerOutcome::Declined).unwrap_err().code(),
            "notFound"
        );
    }

    #[tokio::test]
    async fn test_external_without_signer_is_rejected() {
        let dispatcher =
            SigningDispatcher::new(Arc::new(FakeNode::default()), Arc::new(KeyRing::new()), None);
        assert!(!dispatcher.supports(SigningStrategy::External));

        let tx = TransactionRequest::new().from(Address::zero());
        let err = dispatcher
            .dispatch(Uuid::new_v4(), tx, SigningStrategy::External)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "configError");
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome: SignerOutcome =
            serde_json::from_str(r#"{"outcome":"failed","reason":"user closed wallet"}"#).unwrap();
        assert_eq!(
            outcome,
            SignerOutcome::Failed {
                reason: "user closed wallet".into()
            }
        );
    }
}
