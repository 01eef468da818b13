//! PostgreSQL transaction journal

use crate::config::DatabaseConfig;
use crate::contracts::format_address;
use crate::error::CoordinatorResult;
use crate::tx::{TxRequest, TxStatus};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// One journalled transaction as stored
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub request_id: Uuid,
    pub kind: String,
    pub strategy: String,
    pub from_address: String,
    pub to_address: Option<String>,
    pub alias: Option<String>,
    pub function: Option<String>,
    pub value: String,
    pub state: String,
    pub nonce: Option<u64>,
    pub tx_hash: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Journal of submitted transactions
pub struct TransactionJournal {
    pool: PgPool,
}

/// Serialized name of a unit enum variant (`"nonceAssigned"`, `"managed"`)
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

impl TransactionJournal {
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create the journal table if it does not exist
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                request_id UUID PRIMARY KEY,
                kind VARCHAR(16) NOT NULL,
                strategy VARCHAR(16) NOT NULL,
                from_address VARCHAR(42) NOT NULL,
                to_address VARCHAR(42),
                alias TEXT,
                function TEXT,
                value TEXT NOT NULL,
                state VARCHAR(20) NOT NULL,
                nonce BIGINT,
                tx_hash VARCHAR(66),
                error_code VARCHAR(32),
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_from_nonce
            ON transactions (from_address, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    pub async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or update the row for `request`
    pub async fn record(&self, request: &TxRequest, status: &TxStatus) -> CoordinatorResult<()> {
        let failure = status.failure.as_ref();

        sqlx::query(
            r#"
            INSERT INTO transactions
                (request_id, kind, strategy, from_address, to_address, alias, function,
                 value, state, nonce, tx_hash, error_code, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (request_id)
            DO UPDATE SET state = $9, nonce = $10, tx_hash = $11,
                          error_code = $12, error_message = $13, updated_at = NOW()
            "#,
        )
        .bind(request.request_id)
        .bind(label(&request.kind))
        .bind(request.strategy.as_str())
        .bind(format_address(&request.from))
        .bind(request.to.as_ref().map(format_address))
        .bind(request.alias.as_deref())
        .bind(request.function.as_deref())
        .bind(request.value.to_string())
        .bind(label(&status.state))
        .bind(status.nonce.map(|n| n as i64))
        .bind(status.tx_hash.map(|h| format!("{:?}", h)))
        .bind(failure.map(|f| f.code.as_str()))
        .bind(failure.map(|f| f.message.as_str()))
        .execute(&self.pool)
        .await?;

        debug!(
            "Journalled {} as {}",
            request.request_id,
            label(&status.state)
        );
        Ok(())
    }

    pub async fn get(&self, request_id: Uuid) -> CoordinatorResult<Option<JournalEntry>> {
        let row = sqlx::query(
            r#"
            SELECT request_id, kind, strategy, from_address, to_address, alias, function,
                   value, state, nonce, tx_hash, error_code, error_message,
                   created_at, updated_at
            FROM transactions
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| entry_from_row(&r)))
    }

    /// Most recent transactions sent from `address`
    pub async fn by_sender(&self, address: &str, limit: i64) -> CoordinatorResult<Vec<JournalEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, kind, strategy, from_address, to_address, alias, function,
                   value, state, nonce, tx_hash, error_code, error_message,
                   created_at, updated_at
            FROM transactions
            WHERE from_address = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(address.to_lowercase())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// Row count per lifecycle state
    pub async fn state_counts(&self) -> CoordinatorResult<HashMap<String, u64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM transactions GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("state"), r.get::<i64, _>("total") as u64))
            .collect())
    }
}

fn entry_from_row(row: &PgRow) -> JournalEntry {
    JournalEntry {
        request_id: row.get("request_id"),
        kind: row.get("kind"),
        strategy: row.get("strategy"),
        from_address: row.get("from_address"),
        to_address: row.get("to_address"),
        alias: row.get("alias"),
        function: row.get("function"),
        value: row.get("value"),
        state: row.get("state"),
        nonce: row.get::<Option<i64>, _>("nonce").map(|n| n as u64),
        tx_hash: row.get("tx_hash"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
