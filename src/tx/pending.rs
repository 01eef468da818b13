//! In-flight transaction state and caller callbacks
//!
//! Lifecycle:
//!
//! ```text
//! Idle -> Locked -> NonceAssigned -> Dispatched -> Submitted -> Confirmed
//!                                              \-> Declined
//!  (any non-terminal state before Confirmed)   \-> Errored
//! ```
//!
//! Exactly one of `on_confirmed`, `on_declined` or `on_error` fires per
//! transaction, and nothing fires after it.

use super::signer::SigningStrategy;
use crate::contracts::DecodedEvent;
use crate::error::CoordinatorError;

use ethers::types::{Address, TransactionReceipt, H256, U256};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TxState {
    Idle,
    Locked,
    NonceAssigned,
    Dispatched,
    Submitted,
    Confirmed,
    Declined,
    Errored,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Confirmed | TxState::Declined | TxState::Errored)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Idle, Locked)
                | (Locked, NonceAssigned)
                | (NonceAssigned, Dispatched)
                | (Dispatched, Submitted)
                | (Dispatched, Declined)
                | (Submitted, Confirmed)
                | (Locked | NonceAssigned | Dispatched | Submitted, Errored)
        )
    }
}

/// What kind of transaction is being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TxKind {
    Call,
    Transfer,
    Deploy,
}

/// The caller's request, echoed to every callback
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub request_id: Uuid,
    pub kind: TxKind,
    pub from: Address,
    pub to: Option<Address>,
    /// Alias the target was addressed by, or the alias requested for a deployment
    pub alias: Option<String>,
    pub function: Option<String>,
    pub value: U256,
    pub strategy: SigningStrategy,
}

/// Facts about a transaction that reached the network
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub tx_hash: H256,
    pub from: Address,
    pub nonce: u64,
}

/// Failure reported through `on_error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxFailure {
    pub code: String,
    pub message: String,
}

impl From<&CoordinatorError> for TxFailure {
    fn from(err: &CoordinatorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

pub type SubmittedFn = Arc<dyn Fn(&TxRequest, &Submission) + Send + Sync>;
pub type ConfirmedFn =
    Arc<dyn Fn(&TxRequest, &Submission, &TransactionReceipt, &[DecodedEvent]) + Send + Sync>;
pub type DeclinedFn = Arc<dyn Fn(&TxRequest) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&TxRequest, &TxFailure) + Send + Sync>;

/// Caller-supplied lifecycle hooks
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_submitted: Option<SubmittedFn>,
    pub on_confirmed: Option<ConfirmedFn>,
    pub on_declined: Option<DeclinedFn>,
    pub on_error: Option<ErrorFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_submitted(
        mut self,
        f: impl Fn(&TxRequest, &Submission) + Send + Sync + 'static,
    ) -> Self {
        self.on_submitted = Some(Arc::new(f));
        self
    }

    pub fn on_confirmed(
        mut self,
        f: impl Fn(&TxRequest, &Submission, &TransactionReceipt, &[DecodedEvent])
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.on_confirmed = Some(Arc::new(f));
        self
    }

    pub fn on_declined(mut self, f: impl Fn(&TxRequest) + Send + Sync + 'static) -> Self {
        self.on_declined = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TxRequest, &TxFailure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_submitted", &self.on_submitted.is_some())
            .field("on_confirmed", &self.on_confirmed.is_some())
            .field("on_declined", &self.on_declined.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
    /// Skip the sequencer and use this nonce
    pub nonce: Option<u64>,
    /// Wei sent along with a contract call or deployment
    pub value: Option<U256>,
    pub confirmation_timeout: Option<Duration>,
    pub confirmation_blocks: Option<u64>,
    pub lock_max_wait: Option<Duration>,
    pub callbacks: Callbacks,
}

/// Snapshot published to `TxTicket` holders
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStatus {
    pub state: TxState,
    pub nonce: Option<u64>,
    pub tx_hash: Option<H256>,
    pub failure: Option<TxFailure>,
}

/// Handle returned to the caller of a submission
#[derive(Debug, Clone)]
pub struct TxTicket {
    pub request_id: Uuid,
    pub from: Address,
    status: watch::Receiver<TxStatus>,
}

impl TxTicket {
    pub fn status(&self) -> TxStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> TxState {
        self.status.borrow().state
    }

    pub fn nonce(&self) -> Option<u64> {
        self.status.borrow().nonce
    }

    /// Terminal, or submitted with nothing left to report on it
    pub fn is_settled(&self) -> bool {
        self.state().is_terminal() || self.status.has_changed().is_err()
    }

    /// Wait until the transaction reaches a terminal state, or until nothing
    /// will report on it anymore (submitted without a confirmation watcher)
    pub async fn wait_terminal(&mut self) -> TxStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.state.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

/// One in-flight mutating call
pub struct PendingTransaction {
    pub request: TxRequest,
    callbacks: Callbacks,
    status: watch::Sender<TxStatus>,
    finished: AtomicBool,
}

impl PendingTransaction {
    pub fn new(request: TxRequest, callbacks: Callbacks) -> (Self, TxTicket) {
        let (status, rx) = watch::channel(TxStatus {
            state: TxState::Idle,
            nonce: None,
            tx_hash: None,
            failure: None,
        });
        let ticket = TxTicket {
            request_id: request.request_id,
            from: request.from,
            status: rx,
        };
        (
            Self {
                request,
                callbacks,
                status,
                finished: AtomicBool::new(false),
            },
            ticket,
        )
    }

    pub fn state(&self) -> TxState {
        self.status.borrow().state
    }

    pub fn status(&self) -> TxStatus {
        self.status.borrow().clone()
    }

    pub fn wants_confirmation(&self) -> bool {
        self.callbacks.on_confirmed.is_some()
    }

    /// Move to `next`; invalid moves are refused and logged
    pub fn transition(&self, next: TxState) -> bool {
        self.transition_with(next, |_| {})
    }

    fn transition_with(&self, next: TxState, update: impl FnOnce(&mut TxStatus)) -> bool {
        let mut from = None;
        self.status.send_if_modified(|status| {
            if !status.state.can_transition_to(next) {
                return false;
            }
            from = Some(status.state);
            status.state = next;
            update(status);
            true
        });

        match from {
            Some(from) => {
                debug!(
                    "Transaction {} {:?} -> {:?}",
                    self.request.request_id, from, next
                );
                true
            }
            None => {
                warn!(
                    "Transaction {} refused move to {:?} from {:?}",
                    self.request.request_id,
                    next,
                    self.state()
                );
                false
            }
        }
    }

    pub fn assign_nonce(&self, nonce: u64) -> bool {
        self.transition_with(TxState::NonceAssigned, |s| s.nonce = Some(nonce))
    }

    /// `Dispatched -> Submitted`, then `on_submitted`
    pub fn submitted(&self, submission: &Submission) {
        let tx_hash = submission.tx_hash;
        if self.transition_with(TxState::Submitted, |s| s.tx_hash = Some(tx_hash)) {
            if let Some(cb) = &self.callbacks.on_submitted {
                cb(&self.request, submission);
            }
        }
    }

    fn finish(&self, next: TxState, failure: Option<TxFailure>) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        let moved = self.transition_with(next, |s| {
            if failure.is_some() {
                s.failure = failure;
            }
        });
        if !moved {
            self.finished.store(false, Ordering::SeqCst);
        }
        moved
    }

    pub fn confirmed(
        &self,
        submission: &Submission,
        receipt: &TransactionReceipt,
        events: &[DecodedEvent],
    ) {
        if self.finish(TxState::Confirmed, None) {
            if let Some(cb) = &self.callbacks.on_confirmed {
                cb(&self.request, submission, receipt, events);
            }
        }
    }

    /// Falls back to `on_error` with `txDeclined` when no decline hook is set
    pub fn declined(&self) {
        if !self.finish(TxState::Declined, None) {
            return;
        }
        match (&self.callbacks.on_declined, &self.callbacks.on_error) {
            (Some(cb), _) => cb(&self.request),
            (None, Some(cb)) => cb(&self.request, &TxFailure::from(&CoordinatorError::Declined)),
            (None, None) => {}
        }
    }

    pub fn errored(&self, err: &CoordinatorError) {
        let failure = TxFailure::from(err);
        if !self.finish(TxState::Errored, Some(failure.clone())) {
            return;
        }
        if let Some(cb) = &self.callbacks.on_error {
            cb(&self.request, &failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn request() -> TxRequest {
        TxRequest {
            request_id: Uuid::new_v4(),
            kind: TxKind::Transfer,
            from: Address::repeat_byte(1),
            to: Some(Address::repeat_byte(2)),
            alias: None,
            function: None,
            value: U256::from(1),
            strategy: SigningStrategy::Managed,
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(TxState::Idle.can_transition_to(TxState::Locked));
        assert!(TxState::Dispatched.can_transition_to(TxState::Declined));
        assert!(TxState::Submitted.can_transition_to(TxState::Errored));
        assert!(!TxState::Idle.can_transition_to(TxState::Submitted));
        assert!(!TxState::Submitted.can_transition_to(TxState::Declined));
        assert!(!TxState::Confirmed.can_transition_to(TxState::Errored));
        assert!(!TxState::Errored.can_transition_to(TxState::Confirmed));
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let callbacks = {
            let (a, b) = (fired.clone(), fired.clone());
            Callbacks::new()
                .on_error(move |_, _| {
                    a.fetch_add(1, Ordering::SeqCst);
                })
                .on_declined(move |_| {
                    b.fetch_add(1, Ordering::SeqCst);
                })
        };

        let (pending, mut ticket) = PendingTransaction::new(request(), callbacks);
        pending.transition(TxState::Locked);
        pending.assign_nonce(3);
        pending.transition(TxState::Dispatched);

        pending.declined();
        pending.errored(&CoordinatorError::Declined);
        pending.declined();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let status = ticket.wait_terminal().await;
        assert_eq!(status.state, TxState::Declined);
        assert_eq!(status.nonce, Some(3));
    }

    #[tokio::test]
    async fn test_decline_without_hook_reports_error_code() {
        let code = Arc::new(std::sync::Mutex::new(None));
        let callbacks = {
            let code = code.clone();
            Callbacks::new().on_error(move |_, failure| {
                *code.lock().unwrap() = Some(failure.code.clone());
            })
        };

        let (pending, _ticket) = PendingTransaction::new(request(), callbacks);
        pending.transition(TxState::Locked);
        pending.assign_nonce(0);
        pending.transition(TxState::Dispatched);
        pending.declined();

        assert_eq!(code.lock().unwrap().as_deref(), Some("txDeclined"));
    }

    #[tokio::test]
    async fn test_ticket_returns_when_pending_is_dropped() {
        let (pending, mut ticket) = PendingTransaction::new(request(), Callbacks::new());
        pending.transition(TxState::Locked);
        pending.assign_nonce(1);
        pending.transition(TxState::Dispatched);
        pending.submitted(&Submission {
            tx_hash: H256::repeat_byte(1),
            from: Address::repeat_byte(1),
            nonce: 1,
        });
        assert!(!ticket.is_settled());
        drop(pending);
        assert!(ticket.is_settled());

        let status = ticket.wait_terminal().await;
        assert_eq!(status.state, TxState::Submitted);
        assert_eq!(status.tx_hash, Some(H256::repeat_byte(1)));
    }
}
