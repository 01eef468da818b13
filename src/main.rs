//! EVM transaction coordinator service
//!
//! Serves the HTTP API in front of the transaction engine, with the queue
//! signer for externally approved transactions, the block and contract event
//! follower and an optional PostgreSQL journal.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use evm_tx_coordinator::api::{self, AppState};
use evm_tx_coordinator::chain::{BlockFollower, EventFeed, NodeClient, ReceiptPoller, RpcClient};
use evm_tx_coordinator::config::Settings;
use evm_tx_coordinator::contracts::ContractRegistry;
use evm_tx_coordinator::metrics::MetricsServer;
use evm_tx_coordinator::state::TransactionJournal;
use evm_tx_coordinator::store;
use evm_tx_coordinator::tx::{EngineContext, KeyRing, QueueSigner, TransactionEngine};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting EVM transaction coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: node {}, {} configured contracts",
        settings.network.rpc_url,
        settings.contracts.len()
    );

    // Shared lock and nonce store
    let store = store::connect(&settings.store).await?;

    // Node client
    let rpc = Arc::new(RpcClient::new(&settings.network)?);
    let node: Arc<dyn NodeClient> = rpc.clone();
    match node.chain_id().await {
        Ok(chain_id) => info!("Connected to chain {}", chain_id),
        Err(e) => warn!("Chain id not available yet: {}", e),
    }

    // Optional journal
    let journal = match &settings.database {
        Some(db) => {
            let journal = TransactionJournal::new(db).await?;
            info!("Database connection established");
            journal.run_migrations().await?;
            Some(Arc::new(journal))
        }
        None => {
            info!("No database configured, transaction journal disabled");
            None
        }
    };

    let registry = Arc::new(ContractRegistry::from_config(&settings.contracts).await?);
    info!("Contract registry holds {} contracts", registry.len().await);
    let keyring = Arc::new(KeyRing::from_env(&settings.accounts.private_key_envs)?);
    let signer = Arc::new(QueueSigner::new());
    let watcher = Arc::new(ReceiptPoller::new(
        node.clone(),
        Duration::from_millis(settings.engine.confirmation_poll_ms),
    ));

    let engine = TransactionEngine::new(EngineContext {
        config: settings.engine.clone(),
        store: store.clone(),
        client: node.clone(),
        registry: registry.clone(),
        keyring,
        watcher,
        external_signer: Some(signer.clone()),
        journal: journal.clone(),
    });
    info!("Transaction engine initialized");

    // Block and contract event follower
    let events = Arc::new(EventFeed::new(settings.events.buffer_size));
    let follower_handle = if settings.events.enabled {
        let follower = Arc::new(BlockFollower::new(
            node.clone(),
            registry.clone(),
            events.clone(),
            settings.events.clone(),
        ));
        Some(tokio::spawn(follower.run()))
    } else {
        info!("Event follower disabled");
        None
    };

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState::new(engine, rpc, node.clone(), Some(signer), journal.clone(), events);
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let node = node.clone();
        let journal = journal.clone();
        async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;

                let purged = store.purge_expired();
                if purged > 0 {
                    info!("Purged {} expired store entries", purged);
                }

                if let Err(e) = node.block_number().await {
                    warn!("Node health check failed: {}", e);
                }

                if let Some(journal) = &journal {
                    if let Err(e) = journal.health_check().await {
                        warn!("Database health check failed: {}", e);
                    }
                }
            }
        }
    });

    info!("Coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }
    if let Some(h) = follower_handle {
        h.abort();
    }

    info!("Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,evm_tx_coordinator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
