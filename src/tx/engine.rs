//! Transaction engine
//!
//! Composes the account lock, nonce sequencer, signing dispatcher and
//! confirmation watcher into the submission lifecycle. Input validation
//! happens before the lock is taken and is reported as an `Err`; anything
//! that fails after the lock is reported through `on_error` and the returned
//! ticket. The lock is held from before nonce assignment until the
//! transaction is submitted or abandoned, never until confirmation.
//!
//! Everything after lock acquisition runs on a task the engine owns, so a
//! caller that stops waiting cannot cut a broadcast short.

use super::keyring::{AccountKey, KeyRing};
use super::lock::{AccountLock, LockLease};
use super::nonce::NonceSequencer;
use super::pending::{
    PendingTransaction, Submission, TxKind, TxOptions, TxRequest, TxState, TxTicket,
};
use super::signer::{Dispatch, ExternalSigner, SignerOutcome, SigningDispatcher, SigningStrategy};
use crate::chain::{ConfirmationPolicy, ConfirmationWatcher, NodeClient, WatchOutcome};
use crate::config::{EngineConfig, NonceErrorPolicy};
use crate::contracts::{abi, format_address, is_address, parse_address, ContractEntry, ContractRegistry};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::metrics;
use crate::state::TransactionJournal;
use crate::store::SharedStore;

use ethers::abi::Token;
use ethers::types::{Address, Bytes, TransactionReceipt, TransactionRequest, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything the engine needs from the outside world
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn SharedStore>,
    pub client: Arc<dyn NodeClient>,
    pub registry: Arc<ContractRegistry>,
    pub keyring: Arc<KeyRing>,
    pub watcher: Arc<dyn ConfirmationWatcher>,
    pub external_signer: Option<Arc<dyn ExternalSigner>>,
    pub journal: Option<Arc<TransactionJournal>>,
}

struct EngineInner {
    config: EngineConfig,
    client: Arc<dyn NodeClient>,
    registry: Arc<ContractRegistry>,
    keyring: Arc<KeyRing>,
    watcher: Arc<dyn ConfirmationWatcher>,
    journal: Option<Arc<TransactionJournal>>,
    lock: AccountLock,
    nonces: NonceSequencer,
    dispatcher: SigningDispatcher,
}

/// Contract to register once its deployment confirms
struct Deployment {
    alias: Option<String>,
    abi_json: String,
}

/// Submits transactions and drives them to a terminal state
#[derive(Clone)]
pub struct TransactionEngine {
    inner: Arc<EngineInner>,
}

fn sender(from: &str) -> CoordinatorResult<Address> {
    if from.trim().is_empty() {
        return Err(CoordinatorError::InvalidInput(
            "From address must be provided".into(),
        ));
    }
    parse_address(from)
}

impl TransactionEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let config = ctx.config;
        let lock = AccountLock::new(
            ctx.store.clone(),
            Duration::from_millis(config.lock_poll_initial_ms),
            Duration::from_millis(config.lock_poll_max_ms),
        );
        let nonces = NonceSequencer::new(
            ctx.store.clone(),
            ctx.client.clone(),
            config.namespace.clone(),
            config.nonce_ttl(),
        );
        let dispatcher = SigningDispatcher::new(
            ctx.client.clone(),
            ctx.keyring.clone(),
            ctx.external_signer,
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                client: ctx.client,
                registry: ctx.registry,
                keyring: ctx.keyring,
                watcher: ctx.watcher,
                journal: ctx.journal,
                lock,
                nonces,
                dispatcher,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.inner.registry
    }

    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.inner.keyring
    }

    // ---------------------------------------------------------------------
    // Read-only operations
    // ---------------------------------------------------------------------

    /// ABI-encode a call without sending it
    pub async fn encode_function(
        &self,
        target: &str,
        function: &str,
        params: &[String],
    ) -> CoordinatorResult<Bytes> {
        let entry = self.inner.registry.resolve(target).await?;
        abi::encode_call(entry.function(function)?, params)
    }

    /// Run a view function against the latest block
    pub async fn call_function(
        &self,
        target: &str,
        function: &str,
        params: &[String],
        from: Option<&str>,
    ) -> CoordinatorResult<Vec<Token>> {
        let entry = self.inner.registry.resolve(target).await?;
        let func = entry.function(function)?;
        if !abi::is_view(func) {
            return Err(CoordinatorError::InvalidInput(format!(
                "Function [{}] changes state, use send_transaction",
                function
            )));
        }

        let mut tx = TransactionRequest::new()
            .to(entry.address)
            .data(abi::encode_call(func, params)?);
        if let Some(from) = from {
            tx = tx.from(sender(from)?);
        }

        let output = self.inner.client.call(&tx).await?;
        abi::decode_output(func, &output)
    }

    /// Gas the node expects a state-changing call to use
    pub async fn estimate_transaction(
        &self,
        target: &str,
        function: &str,
        params: &[String],
        from: &str,
    ) -> CoordinatorResult<U256> {
        let from = sender(from)?;
        let entry = self.inner.registry.resolve(target).await?;
        let func = entry.function(function)?;
        let tx = TransactionRequest::new()
            .from(from)
            .to(entry.address)
            .data(abi::encode_call(func, params)?);

        self.inner.client.estimate_gas(&tx).await
    }

    // ---------------------------------------------------------------------
    // Submissions
    // ---------------------------------------------------------------------

    /// Call a state-changing contract function
    pub async fn send_transaction(
        &self,
        target: &str,
        function: &str,
        params: &[String],
        from: &str,
        strategy: SigningStrategy,
        options: TxOptions,
    ) -> CoordinatorResult<TxTicket> {
        let from = sender(from)?;
        let entry = self.inner.registry.resolve(target).await?;
        let func = entry.function(function)?;
        if abi::is_view(func) {
            return Err(CoordinatorError::InvalidInput(format!(
                "Function [{}] is read-only, use call_function",
                function
            )));
        }

        let value = options.value.unwrap_or_default();
        let mut tx = TransactionRequest::new()
            .from(from)
            .to(entry.address)
            .data(abi::encode_call(func, params)?);
        if !value.is_zero() {
            tx = tx.value(value);
        }

        let request = TxRequest {
            request_id: Uuid::new_v4(),
            kind: TxKind::Call,
            from,
            to: Some(entry.address),
            alias: Some(entry.alias.clone()),
            function: Some(function.to_string()),
            value,
            strategy,
        };
        self.submit(request, tx, options, None).await
    }

    /// Transfer ether to a registered contract or a raw address
    pub async fn send_ether(
        &self,
        to: &str,
        amount: U256,
        from: &str,
        strategy: SigningStrategy,
        options: TxOptions,
    ) -> CoordinatorResult<TxTicket> {
        let from = sender(from)?;
        let target = self.inner.registry.resolve_address(to).await?;
        let tx = TransactionRequest::new().from(from).to(target).value(amount);

        let request = TxRequest {
            request_id: Uuid::new_v4(),
            kind: TxKind::Transfer,
            from,
            to: Some(target),
            alias: (!is_address(to)).then(|| to.to_string()),
            function: None,
            value: amount,
            strategy,
        };
        self.submit(request, tx, options, None).await
    }

    /// Deploy a contract; it is registered under `alias` once confirmed
    #[allow(clippy::too_many_arguments)]
    pub async fn create_contract(
        &self,
        alias: Option<&str>,
        bytecode: &str,
        abi_json: &str,
        params: &[String],
        from: &str,
        strategy: SigningStrategy,
        options: TxOptions,
    ) -> CoordinatorResult<TxTicket> {
        let from = sender(from)?;
        let alias = alias.filter(|a| !a.is_empty()).map(str::to_string);
        if let Some(alias) = &alias {
            if self.inner.registry.contains_alias(alias).await {
                return Err(CoordinatorError::DuplicateAlias(alias.clone()));
            }
        }

        let contract_abi = abi::parse_abi(abi_json)?;
        let hex_code = bytecode.trim();
        let hex_code = hex_code.strip_prefix("0x").unwrap_or(hex_code);
        let code = hex::decode(hex_code).map_err(|_| {
            CoordinatorError::InvalidInput("Bytecode must be an hexadecimal string".into())
        })?;
        if code.is_empty() {
            return Err(CoordinatorError::InvalidInput("Bytecode is required".into()));
        }

        let value = options.value.unwrap_or_default();
        let mut tx = TransactionRequest::new()
            .from(from)
            .data(abi::encode_deploy(&contract_abi, &code, params)?);
        if !value.is_zero() {
            tx = tx.value(value);
        }

        let request = TxRequest {
            request_id: Uuid::new_v4(),
            kind: TxKind::Deploy,
            from,
            to: None,
            alias: alias.clone(),
            function: None,
            value,
            strategy,
        };
        let deployment = Deployment {
            alias,
            abi_json: abi_json.to_string(),
        };
        self.submit(request, tx, options, Some(deployment)).await
    }

    async fn submit(
        &self,
        request: TxRequest,
        mut tx: TransactionRequest,
        options: TxOptions,
        deployment: Option<Deployment>,
    ) -> CoordinatorResult<TxTicket> {
        let inner = &self.inner;
        let strategy = request.strategy;
        if !inner.dispatcher.supports(strategy) {
            return Err(CoordinatorError::Config(format!(
                "Signing strategy [{}] is not available",
                strategy.as_str()
            )));
        }

        if let Some(gas) = options.gas {
            tx = tx.gas(gas);
        }
        if let Some(price) = options.gas_price {
            tx = tx.gas_price(price);
        }
        let policy = ConfirmationPolicy {
            blocks: options
                .confirmation_blocks
                .unwrap_or(inner.config.confirmation_blocks),
            timeout: options
                .confirmation_timeout
                .unwrap_or_else(|| inner.config.confirmation_timeout()),
        };
        let max_wait = options
            .lock_max_wait
            .unwrap_or_else(|| inner.config.lock_max_wait());

        let from = request.from;
        let (pending, ticket) = PendingTransaction::new(request, options.callbacks);
        let pending = Arc::new(pending);

        let lease = inner
            .lock
            .acquire(&from, inner.config.lock_ttl(), max_wait)
            .await?;
        pending.transition(TxState::Locked);

        // Once the lock is held the lifecycle belongs to the engine: dropping
        // the caller must not strand a broadcast transaction
        let engine = self.clone();
        let fixed_nonce = options.nonce;
        tokio::spawn(async move {
            engine
                .run_locked(pending, lease, tx, fixed_nonce, policy, deployment)
                .await
        })
        .await
        .map_err(|e| CoordinatorError::Internal(format!("Submission task failed: {}", e)))?;

        Ok(ticket)
    }

    /// Nonce assignment and dispatch, run while holding `lease`
    async fn run_locked(
        &self,
        pending: Arc<PendingTransaction>,
        lease: LockLease,
        tx: TransactionRequest,
        fixed_nonce: Option<u64>,
        policy: ConfirmationPolicy,
        deployment: Option<Deployment>,
    ) {
        let inner = &self.inner;
        let from = pending.request.from;
        let request_id = pending.request.request_id;
        let strategy = pending.request.strategy;

        let nonce = match fixed_nonce {
            Some(nonce) => nonce,
            None => match inner.nonces.next(&from).await {
                Ok(nonce) => nonce,
                Err(e) => {
                    self.fail_before_broadcast(&pending, lease, e).await;
                    return;
                }
            },
        };
        pending.assign_nonce(nonce);
        let tx = tx.nonce(nonce);

        pending.transition(TxState::Dispatched);
        info!(
            "Dispatching {} with nonce {} from {:?} ({})",
            request_id,
            nonce,
            from,
            strategy.as_str()
        );

        match inner.dispatcher.dispatch(request_id, tx, strategy).await {
            Ok(Dispatch::Broadcast(tx_hash)) => {
                self.on_submitted(pending, lease, nonce, tx_hash, policy, deployment)
                    .await;
            }
            Ok(Dispatch::AwaitingSigner(outcome)) => {
                self.journal(&pending).await;
                let engine = self.clone();
                tokio::spawn(async move {
                    engine
                        .await_signer(pending, lease, nonce, outcome, policy, deployment)
                        .await;
                });
            }
            Err(e) => self.fail_before_broadcast(&pending, lease, e).await,
        }
    }

    async fn await_signer(
        &self,
        pending: Arc<PendingTransaction>,
        lease: LockLease,
        nonce: u64,
        outcome: oneshot::Receiver<SignerOutcome>,
        policy: ConfirmationPolicy,
        deployment: Option<Deployment>,
    ) {
        // The wait ends before the lease can expire under us
        let timeout = self.inner.config.signer_wait();
        let request_id = pending.request.request_id;
        let outcome = match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.inner.dispatcher.cancel(request_id).await;
                SignerOutcome::Failed {
                    reason: "signer dropped the request without answering".into(),
                }
            }
            Err(_) => {
                self.inner.dispatcher.cancel(request_id).await;
                SignerOutcome::Failed {
                    reason: format!("no answer from signer within {:?}", timeout),
                }
            }
        };

        match outcome {
            SignerOutcome::Approved { tx_hash } => {
                self.on_submitted(pending, lease, nonce, tx_hash, policy, deployment)
                    .await
            }
            SignerOutcome::Declined => self.on_declined(&pending, lease).await,
            SignerOutcome::Failed { reason } => {
                self.fail_before_broadcast(&pending, lease, CoordinatorError::Signing(reason))
                    .await
            }
        }
    }

    async fn on_submitted(
        &self,
        pending: Arc<PendingTransaction>,
        lease: LockLease,
        nonce: u64,
        tx_hash: ethers::types::H256,
        policy: ConfirmationPolicy,
        deployment: Option<Deployment>,
    ) {
        let from = pending.request.from;
        // Cache before unlocking so the next holder sees this nonce
        if let Err(e) = self.inner.nonces.record_submitted(&from, nonce).await {
            warn!("Could not cache nonce {} for {:?}: {}", nonce, from, e);
        }
        release(&lease).await;

        let submission = Submission {
            tx_hash,
            from,
            nonce,
        };
        pending.submitted(&submission);
        metrics::record_submitted(pending.request.strategy.as_str());
        info!(
            "Transaction {} submitted as {:?} (nonce {})",
            pending.request.request_id, tx_hash, nonce
        );
        self.journal(&pending).await;

        if pending.wants_confirmation() || deployment.is_some() {
            let engine = self.clone();
            tokio::spawn(async move {
                engine
                    .await_confirmation(pending, submission, policy, deployment)
                    .await;
            });
        }
    }

    async fn await_confirmation(
        &self,
        pending: Arc<PendingTransaction>,
        submission: Submission,
        policy: ConfirmationPolicy,
        deployment: Option<Deployment>,
    ) {
        match self.inner.watcher.watch(submission.tx_hash, policy).await {
            WatchOutcome::Confirmed(receipt) => {
                if let Some(deployment) = deployment {
                    self.register_deployment(&deployment, &receipt).await;
                }
                let events = self.inner.registry.decode_logs(&receipt.logs).await;
                metrics::record_confirmed();
                pending.confirmed(&submission, &receipt, &events);
            }
            WatchOutcome::Rejected(err) => {
                // Already on the network: the cached nonce stays
                error!(
                    "Transaction {} ({:?}) failed after submission: {}",
                    pending.request.request_id, submission.tx_hash, err
                );
                metrics::record_error(err.code());
                pending.errored(&err);
            }
        }
        self.journal(&pending).await;
    }

    async fn register_deployment(&self, deployment: &Deployment, receipt: &TransactionReceipt) {
        let address = match receipt.contract_address {
            Some(address) => address,
            None => {
                warn!(
                    "Deployment {:?} confirmed without a contract address",
                    receipt.transaction_hash
                );
                return;
            }
        };

        match self
            .inner
            .registry
            .register(
                deployment.alias.as_deref(),
                &format_address(&address),
                &deployment.abi_json,
            )
            .await
        {
            Ok(entry) => info!("Deployed contract {} at {:?}", entry.alias, address),
            Err(e) => warn!("Could not register deployed contract at {:?}: {}", address, e),
        }
    }

    async fn on_declined(&self, pending: &PendingTransaction, lease: LockLease) {
        let from = pending.request.from;
        if let Err(e) = self.inner.nonces.purge(&from).await {
            warn!("Could not purge nonce for {:?}: {}", from, e);
        }
        release(&lease).await;

        info!("Transaction {} declined by signer", pending.request.request_id);
        metrics::record_declined();
        pending.declined();
        self.journal(pending).await;
    }

    async fn fail_before_broadcast(
        &self,
        pending: &PendingTransaction,
        lease: LockLease,
        err: CoordinatorError,
    ) {
        let from = pending.request.from;
        if self.inner.config.pre_broadcast_nonce_policy == NonceErrorPolicy::Purge
            && err.is_pre_broadcast()
        {
            if let Err(e) = self.inner.nonces.purge(&from).await {
                warn!("Could not purge nonce for {:?}: {}", from, e);
            }
        }
        release(&lease).await;

        error!(
            "Transaction {} failed [{}]: {}",
            pending.request.request_id,
            err.code(),
            err
        );
        metrics::record_error(err.code());
        pending.errored(&err);
        self.journal(pending).await;
    }

    async fn journal(&self, pending: &PendingTransaction) {
        if let Some(journal) = &self.inner.journal {
            if let Err(e) = journal.record(&pending.request, &pending.status()).await {
                warn!(
                    "Failed to journal transaction {}: {}",
                    pending.request.request_id, e
                );
            }
        }
    }

    // ---------------------------------------------------------------------
    // Registry and key ring
    // ---------------------------------------------------------------------

    pub async fn register_contract(
        &self,
        alias: Option<&str>,
        address: &str,
        abi_json: &str,
    ) -> CoordinatorResult<Arc<ContractEntry>> {
        self.inner.registry.register(alias, address, abi_json).await
    }

    pub async fn get_contract(&self, alias_or_address: &str) -> CoordinatorResult<Arc<ContractEntry>> {
        self.inner.registry.resolve(alias_or_address).await
    }

    pub async fn remove_contract(
        &self,
        alias_or_address: &str,
    ) -> CoordinatorResult<Arc<ContractEntry>> {
        self.inner.registry.remove(alias_or_address).await
    }

    pub fn create_account(&self) -> CoordinatorResult<String> {
        self.inner.keyring.create_account()
    }

    pub fn import_account(&self, private_key: &str) -> CoordinatorResult<String> {
        self.inner.keyring.import_account(private_key)
    }

    pub fn export_account(&self, address: &str) -> CoordinatorResult<AccountKey> {
        self.inner.keyring.export_account(address)
    }

    pub fn to_checksum_address(&self, address: &str) -> CoordinatorResult<String> {
        crate::contracts::to_checksum_address(address)
    }
}

async fn release(lease: &LockLease) {
    if let Err(e) = lease.release().await {
        warn!("Failed to release lock {}: {}", lease.key(), e);
    } else {
        debug!("Lock {} released", lease.key());
    }
}
