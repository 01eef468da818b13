//! HTTP API for submitting transactions, resolving signatures and proxying reads

use crate::chain::{firewall, EventFeed, FeedEntry, NodeClient, RpcClient};
use crate::config::ApiConfig;
use crate::contracts::ContractEntry;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::metrics;
use crate::state::TransactionJournal;
use crate::tx::{
    Callbacks, QueueSigner, SignatureRequest, SignerOutcome, SigningStrategy, TransactionEngine,
    TxOptions, TxStatus, TxTicket,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: TransactionEngine,
    pub rpc: Arc<RpcClient>,
    pub node: Arc<dyn NodeClient>,
    pub signer: Option<Arc<QueueSigner>>,
    pub journal: Option<Arc<TransactionJournal>>,
    pub events: Arc<EventFeed>,
    pub tickets: Arc<DashMap<Uuid, TrackedTransaction>>,
}

const TICKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_EVENT_PAGE: usize = 100;

/// Ticket plus the callbacks that fired for it so far
#[derive(Clone)]
pub struct TrackedTransaction {
    ticket: TxTicket,
    callbacks: Arc<std::sync::Mutex<Vec<CallbackEvent>>>,
    /// First time a sweep saw the ticket settled
    settled_at: Arc<OnceLock<Instant>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "callback", rename_all = "camelCase")]
pub enum CallbackEvent {
    #[serde(rename_all = "camelCase")]
    Submitted { tx_hash: H256, nonce: u64 },
    #[serde(rename_all = "camelCase")]
    Confirmed {
        block_number: Option<u64>,
        events: Vec<crate::contracts::DecodedEvent>,
    },
    Declined,
    Error { code: String, message: String },
}

impl AppState {
    pub fn new(
        engine: TransactionEngine,
        rpc: Arc<RpcClient>,
        node: Arc<dyn NodeClient>,
        signer: Option<Arc<QueueSigner>>,
        journal: Option<Arc<TransactionJournal>>,
        events: Arc<EventFeed>,
    ) -> Self {
        Self {
            engine,
            rpc,
            node,
            signer,
            journal,
            events,
            tickets: Arc::new(DashMap::new()),
        }
    }

    /// Forget tickets that settled more than `retention` ago; returns how
    /// many were dropped. The journal keeps the history when configured.
    pub fn evict_settled(&self, retention: Duration) -> usize {
        let before = self.tickets.len();
        self.tickets.retain(|_, tracked| {
            if !tracked.ticket.is_settled() {
                return true;
            }
            tracked.settled_at.get_or_init(Instant::now).elapsed() < retention
        });
        before.saturating_sub(self.tickets.len())
    }
}

async fn sweep_tickets(state: AppState, retention: Duration) {
    let mut ticker = tokio::time::interval(TICKET_SWEEP_INTERVAL.min(retention.max(Duration::from_secs(1))));
    loop {
        ticker.tick().await;
        let evicted = state.evict_settled(retention);
        if evicted > 0 {
            debug!("Evicted {} settled transactions", evicted);
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/contracts", post(register_contract))
        .route(
            "/contracts/:alias",
            get(get_contract).delete(remove_contract),
        )
        .route("/accounts", get(list_accounts).post(create_account))
        .route("/accounts/import", post(import_account))
        .route("/accounts/:address/checksum", get(checksum_address))
        .route("/calls", post(call_function))
        .route("/estimates", post(estimate_transaction))
        .route("/transactions", post(submit_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/signatures", get(list_signatures))
        .route("/signatures/:id", post(resolve_signature))
        .route("/events", get(list_events))
        .route("/rpc", post(proxy_rpc))
        .route("/rpc/methods", get(list_rpc_methods))
        .route("/rpc/:namespace/:method", post(call_method))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    tokio::spawn(sweep_tickets(state.clone(), config.ticket_retention()));
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Config(format!("Cannot bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    Ok(())
}

// Error mapping

/// `CoordinatorError` rendered as `{code, message}`
pub struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoordinatorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::DuplicateAlias(_) | CoordinatorError::DuplicateAddress(_) => {
                StatusCode::CONFLICT
            }
            CoordinatorError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoordinatorError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoordinatorError::Rpc { .. } | CoordinatorError::Broadcast(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ErrorResponse {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_u256(field: &str, value: &str) -> CoordinatorResult<U256> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).ok(),
        None => U256::from_dec_str(value).ok(),
    };
    parsed.ok_or_else(|| CoordinatorError::InvalidInput(format!("{} must be a number", field)))
}

// Handlers

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the node and the journal
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let node = state.node.block_number().await.is_ok();
    let database = match &state.journal {
        Some(journal) => journal.health_check().await.is_ok(),
        None => true,
    };

    let status = if node && database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: node && database,
            node,
            database,
        }),
    )
}

async fn register_contract(
    State(state): State<AppState>,
    Json(body): Json<RegisterContractBody>,
) -> ApiResult<(StatusCode, Json<ContractEntry>)> {
    let abi = match &body.abi {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let entry = state
        .engine
        .register_contract(body.alias.as_deref(), &body.address, &abi)
        .await?;
    Ok((StatusCode::CREATED, Json(entry.as_ref().clone())))
}

async fn get_contract(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> ApiResult<Json<ContractEntry>> {
    let entry = state.engine.get_contract(&alias).await?;
    Ok(Json(entry.as_ref().clone()))
}

async fn remove_contract(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> ApiResult<Json<ContractEntry>> {
    let entry = state.engine.remove_contract(&alias).await?;
    Ok(Json(entry.as_ref().clone()))
}

async fn list_accounts(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut accounts = state.engine.keyring().accounts();
    accounts.sort();
    Json(accounts)
}

async fn create_account(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<AccountResponse>)> {
    let address = state.engine.create_account()?;
    Ok((StatusCode::CREATED, Json(AccountResponse { address })))
}

async fn import_account(
    State(state): State<AppState>,
    Json(body): Json<ImportAccountBody>,
) -> ApiResult<(StatusCode, Json<AccountResponse>)> {
    let address = state.engine.import_account(&body.private_key)?;
    Ok((StatusCode::CREATED, Json(AccountResponse { address })))
}

async fn checksum_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<AccountResponse>> {
    let address = state.engine.to_checksum_address(&address)?;
    Ok(Json(AccountResponse { address }))
}

async fn call_function(
    State(state): State<AppState>,
    Json(body): Json<CallBody>,
) -> ApiResult<Json<CallResponse>> {
    let output = state
        .engine
        .call_function(&body.target, &body.function, &body.params, body.from.as_deref())
        .await?;
    Ok(Json(CallResponse {
        output: output.iter().map(|t| t.to_string()).collect(),
    }))
}

async fn estimate_transaction(
    State(state): State<AppState>,
    Json(body): Json<CallBody>,
) -> ApiResult<Json<EstimateResponse>> {
    let from = body.from.as_deref().unwrap_or_default();
    let gas = state
        .engine
        .estimate_transaction(&body.target, &body.function, &body.params, from)
        .await?;
    Ok(Json(EstimateResponse {
        gas: gas.to_string(),
    }))
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<(StatusCode, Json<TransactionResponse>)> {
    let log: Arc<std::sync::Mutex<Vec<CallbackEvent>>> = Arc::default();
    let options = body.options(&log)?;

    let ticket = match body.kind {
        SubmitKind::Call => {
            let target = required(&body.target, "target")?;
            let function = required(&body.function, "function")?;
            state
                .engine
                .send_transaction(target, function, &body.params, &body.from, body.strategy, options)
                .await?
        }
        SubmitKind::Transfer => {
            let target = required(&body.target, "target")?;
            let amount = parse_u256("value", required(&body.value, "value")?)?;
            state
                .engine
                .send_ether(target, amount, &body.from, body.strategy, options)
                .await?
        }
        SubmitKind::Deploy => {
            let bytecode = required(&body.bytecode, "bytecode")?;
            let abi = match &body.abi {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => return Err(missing("abi").into()),
            };
            state
                .engine
                .create_contract(
                    body.alias.as_deref(),
                    bytecode,
                    &abi,
                    &body.params,
                    &body.from,
                    body.strategy,
                    options,
                )
                .await?
        }
    };

    let response = TransactionResponse {
        request_id: ticket.request_id,
        from: format!("{:?}", ticket.from),
        status: ticket.status(),
        callbacks: log.lock().map(|l| l.clone()).unwrap_or_default(),
    };
    state.tickets.insert(
        ticket.request_id,
        TrackedTransaction {
            ticket,
            callbacks: log,
            settled_at: Arc::default(),
        },
    );
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    if let Some(tracked) = state.tickets.get(&id) {
        let response = TransactionResponse {
            request_id: id,
            from: format!("{:?}", tracked.ticket.from),
            status: tracked.ticket.status(),
            callbacks: tracked
                .callbacks
                .lock()
                .map(|l| l.clone())
                .unwrap_or_default(),
        };
        return Ok(Json(response).into_response());
    }

    if let Some(journal) = &state.journal {
        if let Some(entry) = journal.get(id).await? {
            return Ok(Json(entry).into_response());
        }
    }

    Err(CoordinatorError::NotFound(format!("Transaction [{}]", id)).into())
}

async fn list_signatures(State(state): State<AppState>) -> ApiResult<Json<Vec<SignatureRequest>>> {
    let signer = queue(&state)?;
    Ok(Json(signer.pending()))
}

async fn resolve_signature(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(outcome): Json<SignerOutcome>,
) -> ApiResult<StatusCode> {
    queue(&state)?.resolve(&id, outcome)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<FeedEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_PAGE);
    Json(state.events.since(query.after.unwrap_or(0), limit).await)
}

async fn list_rpc_methods() -> Json<Vec<&'static str>> {
    Json(firewall::allowed_methods())
}

async fn proxy_rpc(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    let method = body
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("undefined")
        .to_string();

    match state.rpc.post(body).await {
        Ok(result) => {
            metrics::record_rpc_request(&method, true);
            Json(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
        }
        Err(e) => {
            metrics::record_rpc_request(&method, false);
            warn!("Proxied {} failed: {}", method, e);
            ApiError(e).into_response()
        }
    }
}

async fn call_method(
    State(state): State<AppState>,
    Path((namespace, method)): Path<(String, String)>,
    Json(params): Json<Vec<Option<Value>>>,
) -> ApiResult<Json<Value>> {
    let result = state.rpc.call_method(&namespace, &method, params).await;
    metrics::record_rpc_request(&format!("{}_{}", namespace, method), result.is_ok());
    Ok(Json(result?))
}

fn queue(state: &AppState) -> CoordinatorResult<&Arc<QueueSigner>> {
    state
        .signer
        .as_ref()
        .ok_or_else(|| CoordinatorError::Config("No external signer queue configured".into()))
}

fn missing(field: &str) -> CoordinatorError {
    CoordinatorError::InvalidInput(format!("{} is required", field))
}

fn required<'a>(value: &'a Option<String>, field: &str) -> CoordinatorResult<&'a str> {
    value.as_deref().ok_or_else(|| missing(field))
}

// Request types

#[derive(Deserialize)]
struct RegisterContractBody {
    alias: Option<String>,
    address: String,
    /// JSON ABI, either inline or as a string
    abi: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportAccountBody {
    private_key: String,
}

#[derive(Deserialize)]
struct CallBody {
    target: String,
    function: String,
    #[serde(default)]
    params: Vec<String>,
    from: Option<String>,
}

#[derive(Deserialize)]
struct EventsQuery {
    /// Sequence of the last event already seen
    after: Option<u64>,
    limit: Option<usize>,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum SubmitKind {
    Call,
    Transfer,
    Deploy,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    kind: SubmitKind,
    from: String,
    #[serde(default = "default_strategy")]
    strategy: SigningStrategy,
    target: Option<String>,
    function: Option<String>,
    #[serde(default)]
    params: Vec<String>,
    /// Wei as a decimal or `0x` string
    value: Option<String>,
    alias: Option<String>,
    bytecode: Option<String>,
    abi: Option<Value>,
    gas: Option<u64>,
    gas_price: Option<String>,
    nonce: Option<u64>,
    /// Wait for confirmation and record `on_confirmed`
    #[serde(default)]
    confirm: bool,
    confirmation_blocks: Option<u64>,
    confirmation_timeout_secs: Option<u64>,
}

fn default_strategy() -> SigningStrategy {
    SigningStrategy::Managed
}

impl SubmitBody {
    fn options(&self, log: &Arc<std::sync::Mutex<Vec<CallbackEvent>>>) -> CoordinatorResult<TxOptions> {
        let gas_price = self
            .gas_price
            .as_deref()
            .map(|p| parse_u256("gasPrice", p))
            .transpose()?;
        // For transfers the amount goes through send_ether, not options
        let value = match self.kind {
            SubmitKind::Transfer => None,
            _ => self.value.as_deref().map(|v| parse_u256("value", v)).transpose()?,
        };

        Ok(TxOptions {
            gas: self.gas.map(U256::from),
            gas_price,
            nonce: self.nonce,
            value,
            confirmation_timeout: self.confirmation_timeout_secs.map(Duration::from_secs),
            confirmation_blocks: self.confirmation_blocks,
            lock_max_wait: None,
            callbacks: recording_callbacks(log, self.confirm),
        })
    }
}

fn recording_callbacks(log: &Arc<std::sync::Mutex<Vec<CallbackEvent>>>, confirm: bool) -> Callbacks {
    let push = {
        let log = log.clone();
        move |event: CallbackEvent| {
            if let Ok(mut events) = log.lock() {
                events.push(event);
            }
        }
    };

    let (on_submitted, on_declined, on_error) = (push.clone(), push.clone(), push.clone());
    let callbacks = Callbacks::new()
        .on_submitted(move |_, s| {
            on_submitted(CallbackEvent::Submitted {
                tx_hash: s.tx_hash,
                nonce: s.nonce,
            })
        })
        .on_declined(move |_| on_declined(CallbackEvent::Declined))
        .on_error(move |_, f| {
            on_error(CallbackEvent::Error {
                code: f.code.clone(),
                message: f.message.clone(),
            })
        });

    if confirm {
        callbacks.on_confirmed(move |_, _, receipt, events| {
            push(CallbackEvent::Confirmed {
                block_number: receipt.block_number.map(|b| b.as_u64()),
                events: events.to_vec(),
            })
        })
    } else {
        callbacks
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    node: bool,
    database: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

#[derive(Serialize)]
struct AccountResponse {
    address: String,
}

#[derive(Serialize)]
struct CallResponse {
    output: Vec<String>,
}

#[derive(Serialize)]
struct EstimateResponse {
    gas: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionResponse {
    request_id: Uuid,
    from: String,
    status: TxStatus,
    callbacks: Vec<CallbackEvent>,
}
