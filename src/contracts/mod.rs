//! Contract registry: alias ↔ address ↔ ABI
//!
//! Contracts come from two places:
//! - configuration, loaded once at startup and never removable
//! - runtime registrations (`register`, or contract creation once confirmed)
//!
//! Lookups accept either an alias or a raw address. Anything that is already a
//! syntactically valid address is looked up by address and never as an alias.

pub mod abi;
pub mod address;

pub use abi::DecodedEvent;
pub use address::{format_address, is_address, parse_address, to_checksum_address};

use crate::config::ContractConfig;
use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::abi::{Abi, Function};
use ethers::types::{Address, Log};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Where a registry entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractSource {
    Config,
    Runtime,
}

/// A registered contract
#[derive(Debug, Clone, Serialize)]
pub struct ContractEntry {
    pub alias: String,
    pub address: Address,
    #[serde(skip)]
    pub abi: Abi,
    #[serde(rename = "abi")]
    pub abi_json: serde_json::Value,
    pub source: ContractSource,
}

impl ContractEntry {
    /// Look up a function definition by name
    pub fn function(&self, name: &str) -> CoordinatorResult<&Function> {
        self.abi
            .function(name)
            .map_err(|_| CoordinatorError::NotFound(format!("Function [{}] in ABI", name)))
    }
}

#[derive(Default)]
struct RegistryInner {
    by_alias: HashMap<String, Arc<ContractEntry>>,
    alias_by_address: HashMap<Address, String>,
}

/// Registry of known contracts
#[derive(Default)]
pub struct ContractRegistry {
    inner: RwLock<RegistryInner>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry seeded with configured contracts
    pub async fn from_config(contracts: &[ContractConfig]) -> CoordinatorResult<Self> {
        let registry = Self::new();
        for contract in contracts {
            registry
                .insert(
                    contract.alias.as_deref(),
                    &contract.address,
                    &contract.abi,
                    ContractSource::Config,
                )
                .await?;
        }
        info!("Contract registry loaded {} configured contracts", contracts.len());
        Ok(registry)
    }

    /// Register a contract at runtime
    ///
    /// Without an alias the lower-cased address becomes the alias.
    pub async fn register(
        &self,
        alias: Option<&str>,
        address: &str,
        abi_json: &str,
    ) -> CoordinatorResult<Arc<ContractEntry>> {
        self.insert(alias, address, abi_json, ContractSource::Runtime)
            .await
    }

    async fn insert(
        &self,
        alias: Option<&str>,
        address: &str,
        abi_json: &str,
        source: ContractSource,
    ) -> CoordinatorResult<Arc<ContractEntry>> {
        if address.is_empty() {
            return Err(CoordinatorError::InvalidInput("Address is required".into()));
        }
        let parsed = parse_address(address)?;
        if abi_json.trim().is_empty() {
            return Err(CoordinatorError::InvalidInput("ABI is required".into()));
        }
        let abi = abi::parse_abi(abi_json)?;
        let abi_value: serde_json::Value = serde_json::from_str(abi_json)
            .map_err(|e| CoordinatorError::InvalidInput(format!("Invalid ABI: {}", e)))?;

        let alias = match alias {
            Some(a) if !a.is_empty() && !a.eq_ignore_ascii_case(address) => a.to_string(),
            _ => format_address(&parsed),
        };

        let mut inner = self.inner.write().await;
        if inner.by_alias.contains_key(&alias) {
            return Err(CoordinatorError::DuplicateAlias(alias));
        }
        if inner.alias_by_address.contains_key(&parsed) {
            return Err(CoordinatorError::DuplicateAddress(format_address(&parsed)));
        }

        let entry = Arc::new(ContractEntry {
            alias: alias.clone(),
            address: parsed,
            abi,
            abi_json: abi_value,
            source,
        });
        inner.alias_by_address.insert(parsed, alias.clone());
        inner.by_alias.insert(alias.clone(), entry.clone());

        debug!("Registered contract {} at {:?} ({:?})", alias, parsed, source);
        Ok(entry)
    }

    /// Resolve an alias or address to its registry entry
    pub async fn resolve(&self, alias_or_address: &str) -> CoordinatorResult<Arc<ContractEntry>> {
        if alias_or_address.is_empty() {
            return Err(CoordinatorError::InvalidInput(
                "Alias or address cannot be empty".into(),
            ));
        }

        let inner = self.inner.read().await;
        let alias = if is_address(alias_or_address) {
            let address = parse_address(alias_or_address)?;
            inner.alias_by_address.get(&address).cloned()
        } else {
            Some(alias_or_address.to_string())
        };

        alias
            .and_then(|a| inner.by_alias.get(&a).cloned())
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!(
                    "Contract with alias or address [{}]",
                    alias_or_address
                ))
            })
    }

    /// Resolve to an address; raw addresses resolve to themselves even when unregistered
    pub async fn resolve_address(&self, alias_or_address: &str) -> CoordinatorResult<Address> {
        if is_address(alias_or_address) {
            return parse_address(alias_or_address);
        }
        Ok(self.resolve(alias_or_address).await?.address)
    }

    /// Remove a runtime-registered contract
    pub async fn remove(&self, alias_or_address: &str) -> CoordinatorResult<Arc<ContractEntry>> {
        let entry = self.resolve(alias_or_address).await?;
        if entry.source == ContractSource::Config {
            return Err(CoordinatorError::InvalidInput(format!(
                "Contract [{}] is configured and cannot be removed",
                entry.alias
            )));
        }

        let mut inner = self.inner.write().await;
        inner.by_alias.remove(&entry.alias);
        inner.alias_by_address.remove(&entry.address);

        info!("Removed contract {} at {:?}", entry.alias, entry.address);
        Ok(entry)
    }

    /// Check whether an alias is taken
    pub async fn contains_alias(&self, alias: &str) -> bool {
        self.inner.read().await.by_alias.contains_key(alias)
    }

    /// Decode receipt logs emitted by registered contracts; others are skipped
    pub async fn decode_logs(&self, logs: &[Log]) -> Vec<DecodedEvent> {
        let inner = self.inner.read().await;
        logs.iter()
            .filter_map(|log| {
                let alias = inner.alias_by_address.get(&log.address)?;
                let entry = inner.by_alias.get(alias)?;
                abi::decode_log(&entry.abi, log)
            })
            .collect()
    }

    /// Decode one log if it was emitted by a registered contract
    pub async fn decode_log(&self, log: &Log) -> Option<DecodedEvent> {
        let inner = self.inner.read().await;
        let alias = inner.alias_by_address.get(&log.address)?;
        abi::decode_log(&inner.by_alias.get(alias)?.abi, log)
    }

    /// Addresses of every registered contract
    pub async fn addresses(&self) -> Vec<Address> {
        self.inner.read().await.alias_by_address.keys().copied().collect()
    }

    /// Number of registered contracts
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_alias.len()
    }
}

#[cfg(test)]
mod tests {
    use super::abi::tests::TOKEN_ABI;
    use super::*;

    const TOKEN_ADDRESS: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[tokio::test]
    async fn test_register_and_resolve_by_alias_or_address() {
        let registry = ContractRegistry::new();
        registry
            .register(Some("Token"), TOKEN_ADDRESS, TOKEN_ABI)
            .await
            .unwrap();

        let by_alias = registry.resolve("Token").await.unwrap();
        let by_address = registry.resolve(TOKEN_ADDRESS).await.unwrap();
        let by_lower = registry
            .resolve(&TOKEN_ADDRESS.to_lowercase())
            .await
            .unwrap();

        assert_eq!(by_alias.address, by_address.address);
        assert_eq!(by_alias.alias, by_lower.alias);
        assert!(by_alias.function("transfer").is_ok());
    }

    #[tokio::test]
    async fn test_missing_alias_defaults_to_address() {
        let registry = ContractRegistry::new();
        let entry = registry.register(None, TOKEN_ADDRESS, TOKEN_ABI).await.unwrap();
        assert_eq!(entry.alias, TOKEN_ADDRESS.to_lowercase());
        assert!(registry.resolve(TOKEN_ADDRESS).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let registry = ContractRegistry::new();

        let err = registry
            .register(Some("Token"), "0x1234", TOKEN_ABI)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidInput(_)));

        registry
            .register(Some("Token"), TOKEN_ADDRESS, TOKEN_ABI)
            .await
            .unwrap();

        let err = registry
            .register(
                Some("Token"),
                "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
                TOKEN_ABI,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateAlias(_)));

        let err = registry
            .register(Some("Other"), TOKEN_ADDRESS, TOKEN_ABI)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateAddress(_)));
    }

    #[tokio::test]
    async fn test_address_is_not_treated_as_alias() {
        let registry = ContractRegistry::new();
        let err = registry.resolve(TOKEN_ADDRESS).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));

        let address = registry.resolve_address(TOKEN_ADDRESS).await.unwrap();
        assert_eq!(address, parse_address(TOKEN_ADDRESS).unwrap());
    }

    #[tokio::test]
    async fn test_remove_runtime_but_not_configured() {
        let configured = vec![ContractConfig {
            alias: Some("Fixed".into()),
            address: "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359".into(),
            abi: TOKEN_ABI.into(),
        }];
        let registry = ContractRegistry::from_config(&configured).await.unwrap();
        registry
            .register(Some("Token"), TOKEN_ADDRESS, TOKEN_ABI)
            .await
            .unwrap();

        assert!(registry.remove("Fixed").await.is_err());
        let removed = registry.remove(TOKEN_ADDRESS).await.unwrap();
        assert_eq!(removed.alias, "Token");
        assert!(registry.resolve("Token").await.is_err());
        assert_eq!(registry.len().await, 1);
        assert_eq!(
            registry.addresses().await,
            vec![parse_address("0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359").unwrap()]
        );
    }
}
