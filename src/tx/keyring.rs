//! In-memory key ring for locally managed signing
//!
//! Keys live for the lifetime of the process only. Nothing here is persisted.

use crate::contracts::{format_address, parse_address};
use crate::error::{CoordinatorError, CoordinatorResult};

use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use ethers::utils::to_checksum;
use serde::Serialize;
use tracing::{info, warn};

/// Exported key material
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountKey {
    pub address: String,
    pub private_key: String,
}

/// Wallets indexed by address
#[derive(Default)]
pub struct KeyRing {
    wallets: DashMap<Address, LocalWallet>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load private keys from the named environment variables; unset ones are skipped
    pub fn from_env(vars: &[String]) -> CoordinatorResult<Self> {
        let ring = Self::new();
        for var in vars {
            match std::env::var(var) {
                Ok(key) => {
                    let address = ring.import_account(&key)?;
                    info!("Loaded account {} from {}", address, var);
                }
                Err(_) => warn!("Account key variable {} is not set", var),
            }
        }
        Ok(ring)
    }

    /// Generate a fresh key; returns its checksummed address
    pub fn create_account(&self) -> CoordinatorResult<String> {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let address = wallet.address();
        self.wallets.insert(address, wallet);
        Ok(to_checksum(&address, None))
    }

    /// Import a hex private key, with or without `0x`
    pub fn import_account(&self, private_key: &str) -> CoordinatorResult<String> {
        let trimmed = private_key.trim();
        if trimmed.is_empty() {
            return Err(CoordinatorError::InvalidInput(
                "Private key must be provided".into(),
            ));
        }

        let wallet: LocalWallet = trimmed.parse().map_err(|_| {
            CoordinatorError::InvalidInput(
                "Invalid private key. Must be an hexadecimal string.".into(),
            )
        })?;
        let address = wallet.address();
        if self.wallets.contains_key(&address) {
            return Err(CoordinatorError::InvalidInput(
                "An account with that address already exists".into(),
            ));
        }

        self.wallets.insert(address, wallet);
        Ok(to_checksum(&address, None))
    }

    /// Export the key held for `address`
    pub fn export_account(&self, address: &str) -> CoordinatorResult<AccountKey> {
        let parsed = parse_address(address)?;
        let wallet = self
            .wallets
            .get(&parsed)
            .ok_or_else(|| CoordinatorError::NotFound(format!("Account [{}]", address)))?;

        Ok(AccountKey {
            address: to_checksum(&parsed, None),
            private_key: format!("0x{}", hex::encode(wallet.signer().to_bytes())),
        })
    }

    /// Signing wallet for `address`; a missing key is a signing failure
    pub fn wallet(&self, address: &Address) -> CoordinatorResult<LocalWallet> {
        self.wallets
            .get(address)
            .map(|w| w.clone())
            .ok_or_else(|| {
                CoordinatorError::Signing(format!("no key held for {}", format_address(address)))
            })
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.wallets.contains_key(address)
    }

    /// Checksummed addresses of every held key
    pub fn accounts(&self) -> Vec<String> {
        self.wallets
            .iter()
            .map(|entry| to_checksum(entry.key(), None))
            .collect()
    }
}
