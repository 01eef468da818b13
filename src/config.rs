//! Configuration management for the transaction coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
    #[serde(default)]
    pub accounts: AccountsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of the nonce cache keys in the shared store
    pub namespace: String,
    pub lock_ttl_ms: u64,
    pub lock_max_wait_ms: u64,
    pub lock_poll_initial_ms: u64,
    pub lock_poll_max_ms: u64,
    pub nonce_ttl_ms: u64,
    /// Upper bound on waiting for an external signer's answer; must stay
    /// below `lock_ttl_ms`
    pub signer_timeout_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub confirmation_blocks: u64,
    pub confirmation_poll_ms: u64,
    pub pre_broadcast_nonce_policy: NonceErrorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "ethereum-endpoint".to_string(),
            lock_ttl_ms: 10 * 60 * 1000,
            lock_max_wait_ms: 5 * 60 * 1000,
            lock_poll_initial_ms: 100,
            lock_poll_max_ms: 1000,
            nonce_ttl_ms: 2 * 60 * 1000,
            signer_timeout_ms: 5 * 60 * 1000,
            confirmation_timeout_secs: 1800,
            confirmation_blocks: 0,
            confirmation_poll_ms: 2000,
            pre_broadcast_nonce_policy: NonceErrorPolicy::Purge,
        }
    }
}

impl EngineConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_max_wait(&self) -> Duration {
        Duration::from_millis(self.lock_max_wait_ms)
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_millis(self.nonce_ttl_ms)
    }

    pub fn signer_timeout(&self) -> Duration {
        Duration::from_millis(self.signer_timeout_ms)
    }

    /// How long a lock holder waits on the external signer: the configured
    /// timeout, but never past 90% of the lease
    pub fn signer_wait(&self) -> Duration {
        self.signer_timeout().min(self.lock_ttl().mul_f64(0.9))
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

/// What happens to the cached nonce when a submission fails before broadcast
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NonceErrorPolicy {
    /// Drop the cache entry so the next call asks the network
    Purge,
    /// Leave the cache entry as it was
    Retain,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: String,
    /// Overrides `net_version` when set
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// How long settled transactions stay queryable from memory
    #[serde(default = "default_ticket_retention_secs")]
    pub ticket_retention_secs: u64,
}

fn default_ticket_retention_secs() -> u64 {
    3600
}

impl ApiConfig {
    pub fn ticket_retention(&self) -> Duration {
        Duration::from_secs(self.ticket_retention_secs)
    }
}

/// Block and contract event follower
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    pub poll_ms: u64,
    /// Depth a block needs before its contract events are published
    pub confirmation_blocks: u64,
    /// Recent block hashes kept for reorg detection
    pub history_blocks: usize,
    /// Furthest the follower walks back when it fell behind
    pub max_catch_up: usize,
    /// Published events kept for `GET /events`
    pub buffer_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_ms: 5000,
            confirmation_blocks: 0,
            history_blocks: 12,
            max_catch_up: 360,
            buffer_size: 1000,
        }
    }
}

impl EventsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Contract known at startup; cannot be removed at runtime
#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub alias: Option<String>,
    pub address: String,
    /// JSON ABI as a string
    pub abi: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AccountsConfig {
    /// Names of environment variables holding private keys to import at boot
    #[serde(default)]
    pub private_key_envs: Vec<String>,
}

impl Settings {
    /// Load settings from the file named by `COORDINATOR_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("COORDINATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.network.rpc_url.is_empty() {
            anyhow::bail!("network.rpc_url must be set");
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            anyhow::bail!("store.redis_url is required for the redis backend");
        }

        if self.engine.lock_poll_initial_ms == 0 {
            anyhow::bail!("engine.lock_poll_initial_ms must be positive");
        }

        if self.engine.signer_timeout_ms >= self.engine.lock_ttl_ms {
            anyhow::bail!(
                "engine.signer_timeout_ms ({}) must be below engine.lock_ttl_ms ({})",
                self.engine.signer_timeout_ms,
                self.engine.lock_ttl_ms
            );
        }

        if self.events.enabled && (self.events.poll_ms == 0 || self.events.history_blocks == 0) {
            anyhow::bail!("events.poll_ms and events.history_blocks must be positive");
        }

        if self.engine.lock_max_wait_ms > self.engine.lock_ttl_ms {
            tracing::warn!(
                "lock_max_wait_ms ({}) exceeds lock_ttl_ms ({}); a stuck lease expires before waiters give up",
                self.engine.lock_max_wait_ms,
                self.engine.lock_ttl_ms
            );
        }

        for contract in &self.contracts {
            if !crate::contracts::is_address(&contract.address) {
                anyhow::bail!("Contract {:?} has an invalid address", contract.alias);
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
