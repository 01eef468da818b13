//! Transaction submission: account locking, nonce sequencing, signing and confirmation

mod engine;
mod gas;
mod keyring;
mod lock;
mod nonce;
mod pending;
mod signer;

pub use engine::{EngineContext, TransactionEngine};
pub use gas::GasFiller;
pub use keyring::{AccountKey, KeyRing};
pub use lock::{lock_backoff, AccountLock, LockLease};
pub use nonce::NonceSequencer;
pub use pending::{
    Callbacks, PendingTransaction, Submission, TxFailure, TxKind, TxOptions, TxRequest, TxState,
    TxStatus, TxTicket,
};
pub use signer::{
    Dispatch, ExternalSigner, QueueSigner, SignatureRequest, SignerOutcome, SignerReply,
    SigningDispatcher, SigningStrategy,
};
