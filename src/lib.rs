//! EVM transaction coordinator
//!
//! Submits state-changing calls to an EVM network with at most one mutating
//! operation in flight per sending account, and drives each one through
//! lock, nonce, signing, broadcast and confirmation while reporting to
//! caller-supplied callbacks.

pub mod api;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod metrics;
pub mod state;
pub mod store;
pub mod tx;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CoordinatorError, CoordinatorResult};
