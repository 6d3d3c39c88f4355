//! SQLite journal
//!
//! Handles:
//! - Processed message hashes (replay protection across restarts)
//! - Order state snapshots and the transition audit log
//! - Block checkpoints for restart recovery

use crate::error::{RelayerError, RelayerResult};
use crate::state::{OrderRecord, StateTransition, SwapState};
use crate::types::{ChainId, MessageHash, OrderId};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Durable write-through store for the ledger and order states
pub struct Journal {
    pool: SqlitePool,
}

impl Journal {
    /// Open (creating if needed) the database at `url` and run migrations
    pub async fn connect(url: &str, max_connections: u32) -> RelayerResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let journal = Self { pool };
        journal.run_migrations().await?;
        info!("Journal opened at {}", url);
        Ok(journal)
    }

    /// Private in-memory database; lives as long as the journal
    pub async fn in_memory() -> RelayerResult<Self> {
        // Every sqlite memory connection is its own database, so pin one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let journal = Self { pool };
        journal.run_migrations().await?;
        Ok(journal)
    }

    async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_messages (
                message_hash TEXT PRIMARY KEY,
                registered_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_states (
                order_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                from_state TEXT,
                to_state TEXT NOT NULL,
                reason TEXT NOT NULL,
                at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_history_order
            ON order_history (order_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain TEXT PRIMARY KEY,
                block_number INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Journal migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a processed hash. Returns false if it was already present.
    pub async fn record_processed(&self, hash: &MessageHash, at: u64) -> RelayerResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_messages (message_hash, registered_at) VALUES (?1, ?2)",
        )
        .bind(hash.to_string())
        .bind(at as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn processed_hashes(&self) -> RelayerResult<Vec<(MessageHash, u64)>> {
        let rows = sqlx::query("SELECT message_hash, registered_at FROM processed_messages")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> RelayerResult<(MessageHash, u64)> {
                let raw: String = row.try_get("message_hash")?;
                let at: i64 = row.try_get("registered_at")?;
                let hash = raw
                    .parse::<MessageHash>()
                    .map_err(|e| RelayerError::Internal(format!("bad hash {} in journal: {}", raw, e)))?;
                Ok((hash, at as u64))
            })
            .collect()
    }

    /// Upsert the latest snapshot of an order
    pub async fn save_order(&self, record: &OrderRecord) -> RelayerResult<()> {
        let body = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO order_states (order_id, state, record, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (order_id)
            DO UPDATE SET state = ?2, record = ?3, updated_at = ?4
            "#,
        )
        .bind(record.order.order_id.to_string())
        .bind(record.state.as_str())
        .bind(body)
        .bind(record.updated_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn append_history(&self, order_id: &OrderId, entry: &StateTransition) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_history (order_id, from_state, to_state, reason, at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(order_id.to_string())
        .bind(entry.from.map(|s| s.as_str()))
        .bind(entry.to.as_str())
        .bind(&entry.reason)
        .bind(entry.at as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Audit log for one order, oldest first
    pub async fn history(&self, order_id: &OrderId) -> RelayerResult<Vec<StateTransition>> {
        let rows = sqlx::query(
            "SELECT from_state, to_state, reason, at FROM order_history WHERE order_id = ?1 ORDER BY id",
        )
        .bind(order_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> RelayerResult<StateTransition> {
                let from: Option<String> = row.try_get("from_state")?;
                let to: String = row.try_get("to_state")?;
                let parse = |raw: &str| {
                    raw.parse::<SwapState>()
                        .map_err(|e| RelayerError::Internal(format!("bad state in journal: {}", e)))
                };
                Ok(StateTransition {
                    from: from.as_deref().map(parse).transpose()?,
                    to: parse(to.as_str())?,
                    reason: row.try_get("reason")?,
                    at: row.try_get::<i64, _>("at")? as u64,
                })
            })
            .collect()
    }

    pub async fn load_orders(&self) -> RelayerResult<Vec<OrderRecord>> {
        let rows = sqlx::query("SELECT record FROM order_states")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> RelayerResult<OrderRecord> {
                let body: String = row.try_get("record")?;
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }

    /// Get block checkpoint for a chain
    pub async fn get_checkpoint(&self, chain: ChainId) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE chain = ?1")
            .bind(chain.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>("block_number")? as u64)),
            None => Ok(None),
        }
    }

    /// Save block checkpoint for a chain
    pub async fn save_checkpoint(&self, chain: ChainId, block_number: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain, block_number, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT (chain)
            DO UPDATE SET block_number = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(chain.as_str())
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for chain {}: block {}", chain, block_number);
        Ok(())
    }
}
