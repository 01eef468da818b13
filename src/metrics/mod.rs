//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction lifecycle outcomes
//! - Account lock contention
//! - External signature backlog
//! - RPC proxy traffic

use crate::error::{CoordinatorError, CoordinatorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Encoder, Gauge,
    Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "coordinator_transactions_submitted_total",
        "Transactions that reached the network",
        &["strategy"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "coordinator_transactions_confirmed_total",
        "Transactions confirmed on chain",
        &[]
    ).unwrap();

    pub static ref TX_DECLINED: CounterVec = register_counter_vec!(
        "coordinator_transactions_declined_total",
        "Transactions declined by an external signer",
        &[]
    ).unwrap();

    pub static ref TX_ERRORS: CounterVec = register_counter_vec!(
        "coordinator_transaction_errors_total",
        "Failed transactions by error code",
        &["code"]
    ).unwrap();

    // Lock metrics
    pub static ref LOCK_WAIT: Histogram = register_histogram!(
        "coordinator_lock_wait_seconds",
        "Time spent waiting for an account lock",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0]
    ).unwrap();

    pub static ref LOCK_TIMEOUTS: CounterVec = register_counter_vec!(
        "coordinator_lock_timeouts_total",
        "Account lock acquisitions that gave up",
        &[]
    ).unwrap();

    // Signer metrics
    pub static ref PENDING_SIGNATURES: Gauge = register_gauge!(
        "coordinator_pending_signatures",
        "Transactions waiting on the external signer"
    ).unwrap();

    // RPC proxy metrics
    pub static ref RPC_REQUESTS: CounterVec = register_counter_vec!(
        "coordinator_rpc_requests_total",
        "Proxied JSON-RPC requests by method and result",
        &["method", "result"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Config(format!("Cannot bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Render every registered metric in the text exposition format
pub fn render() -> CoordinatorResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| CoordinatorError::Internal(e.to_string()))
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_submitted(strategy: &str) {
    TX_SUBMITTED.with_label_values(&[strategy]).inc();
}

pub fn record_confirmed() {
    TX_CONFIRMED.with_label_values(&[]).inc();
}

pub fn record_declined() {
    TX_DECLINED.with_label_values(&[]).inc();
}

pub fn record_error(code: &str) {
    TX_ERRORS.with_label_values(&[code]).inc();
}

pub fn record_lock_wait(seconds: f64) {
    LOCK_WAIT.observe(seconds);
}

pub fn record_lock_timeout() {
    LOCK_TIMEOUTS.with_label_values(&[]).inc();
}

pub fn set_pending_signatures(count: usize) {
    PENDING_SIGNATURES.set(count as f64);
}

pub fn record_rpc_request(method: &str, ok: bool) {
    RPC_REQUESTS
        .with_label_values(&[method, if ok { "ok" } else { "error" }])
        .inc();
}
