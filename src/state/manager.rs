//! PostgreSQL intent store

use crate::config::StorageConfig;
use crate::error::{SettlerError, SettlerResult};
use crate::intent::{Intent, IntentStatus, IntentStore, IntentUpdate, NonceRecord};
use crate::oracle::PriceRecord;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

const INTENT_COLUMNS: &str = r#"
    id, direction, source_address, source_tx_hash, amount_in, target_address,
    target_tx_hash, amount_out, quoted_amount_out, min_amount_out, status, expiry,
    created_at, updated_at, fulfilled_at, error, payout_reference, dispatch_attempts, payload
"#;

/// Intent store backed by PostgreSQL
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &StorageConfig) -> SettlerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(SettlerError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SettlerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intents (
                id VARCHAR(64) PRIMARY KEY,
                direction VARCHAR(8) NOT NULL,
                source_address VARCHAR(128) NOT NULL,
                source_tx_hash VARCHAR(128) NOT NULL UNIQUE,
                amount_in DOUBLE PRECISION NOT NULL,
                target_address VARCHAR(128) NOT NULL,
                target_tx_hash VARCHAR(128),
                amount_out DOUBLE PRECISION,
                quoted_amount_out DOUBLE PRECISION NOT NULL,
                min_amount_out DOUBLE PRECISION NOT NULL,
                status VARCHAR(20) NOT NULL,
                expiry BIGINT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                fulfilled_at BIGINT,
                error TEXT,
                payout_reference VARCHAR(128),
                dispatch_attempts INTEGER NOT NULL DEFAULT 0,
                payload JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_intents_status
            ON intents (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consumed_nonces (
                nonce VARCHAR(256) PRIMARY KEY,
                source_tx_hash VARCHAR(128) NOT NULL,
                consumed_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_history (
                id BIGSERIAL PRIMARY KEY,
                rate DOUBLE PRECISION NOT NULL,
                recorded_at BIGINT NOT NULL,
                reason VARCHAR(32) NOT NULL,
                volume DOUBLE PRECISION,
                direction VARCHAR(8)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn fetch_by_status(&self, status: IntentStatus) -> SettlerResult<Vec<Intent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM intents WHERE status = $1 ORDER BY created_at",
            INTENT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(intent_from_row).collect()
    }
}

#[async_trait]
impl IntentStore for StateManager {
    async fn create(&self, intent: &Intent) -> SettlerResult<()> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO intents ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (source_tx_hash) DO NOTHING
            "#,
            INTENT_COLUMNS
        ))
        .bind(&intent.id)
        .bind(intent.direction.as_str())
        .bind(&intent.source_address)
        .bind(&intent.source_tx_hash)
        .bind(intent.amount_in)
        .bind(&intent.target_address)
        .bind(&intent.target_tx_hash)
        .bind(intent.amount_out)
        .bind(intent.quoted_amount_out)
        .bind(intent.min_amount_out)
        .bind(intent.status.as_str())
        .bind(intent.expiry)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .bind(intent.fulfilled_at)
        .bind(&intent.error)
        .bind(&intent.payout_reference)
        .bind(intent.dispatch_attempts as i32)
        .bind(&intent.payload)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SettlerError::DuplicateDeposit {
                source_tx_hash: intent.source_tx_hash.clone(),
            });
        }

        debug!("Stored intent {} ({})", intent.id, intent.status);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> SettlerResult<Option<Intent>> {
        let row = sqlx::query(&format!("SELECT {} FROM intents WHERE id = $1", INTENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn get_by_source_reference(
        &self,
        source_tx_hash: &str,
    ) -> SettlerResult<Option<Intent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM intents WHERE source_tx_hash = $1",
            INTENT_COLUMNS
        ))
        .bind(source_tx_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn update(&self, id: &str, update: IntentUpdate) -> SettlerResult<Intent> {
        // Single conditional statement: terminal rows are never touched
        let row = sqlx::query(&format!(
            r#"
            UPDATE intents SET
                status = COALESCE($2, status),
                target_tx_hash = COALESCE($3, target_tx_hash),
                amount_out = COALESCE($4, amount_out),
                fulfilled_at = COALESCE($5, fulfilled_at),
                error = COALESCE($6, error),
                payout_reference = CASE WHEN $7 THEN $8 ELSE payout_reference END,
                dispatch_attempts = COALESCE($9, dispatch_attempts),
                updated_at = $10
            WHERE id = $1 AND status IN ('open', 'pending')
            RETURNING {}
            "#,
            INTENT_COLUMNS
        ))
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.target_tx_hash)
        .bind(update.amount_out)
        .bind(update.fulfilled_at)
        .bind(&update.error)
        .bind(update.payout_reference.is_some())
        .bind(update.payout_reference.clone().flatten())
        .bind(update.dispatch_attempts.map(|a| a as i32))
        .bind(update.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => intent_from_row(&row),
            None => match self.get_by_id(id).await? {
                Some(existing) => Err(SettlerError::InvalidStateTransition {
                    from: existing.status.to_string(),
                    to: update
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| existing.status.to_string()),
                }),
                None => Err(SettlerError::IntentNotFound { id: id.to_string() }),
            },
        }
    }

    async fn claim_for_dispatch(&self, id: &str, now: i64) -> SettlerResult<Option<Intent>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE intents SET status = 'open', updated_at = $2
            WHERE id = $1
              AND status IN ('open', 'pending')
              AND payout_reference IS NULL
            RETURNING {}
            "#,
            INTENT_COLUMNS
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(intent_from_row(&row)?)),
            None => match self.get_by_id(id).await? {
                Some(_) => Ok(None),
                None => Err(SettlerError::IntentNotFound { id: id.to_string() }),
            },
        }
    }

    async fn list_open(&self) -> SettlerResult<Vec<Intent>> {
        self.fetch_by_status(IntentStatus::Open).await
    }

    async fn list_pending(&self) -> SettlerResult<Vec<Intent>> {
        self.fetch_by_status(IntentStatus::Pending).await
    }

    async fn nonce_exists(&self, nonce: &str) -> SettlerResult<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM consumed_nonces WHERE nonce = $1")
            .bind(nonce)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_nonce(&self, record: &NonceRecord) -> SettlerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumed_nonces (nonce, source_tx_hash, consumed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (nonce) DO UPDATE SET consumed_at = consumed_nonces.consumed_at
            WHERE consumed_nonces.source_tx_hash = EXCLUDED.source_tx_hash
            "#,
        )
        .bind(&record.nonce)
        .bind(&record.source_tx_hash)
        .bind(record.consumed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_rate(&self, record: &PriceRecord) -> SettlerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_history (rate, recorded_at, reason, volume, direction)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.rate)
        .bind(record.timestamp)
        .bind(record.reason.as_str())
        .bind(record.volume)
        .bind(record.direction.map(|d| d.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn rate_tail(&self, limit: usize) -> SettlerResult<Vec<PriceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT rate, recorded_at, reason, volume, direction
            FROM rate_history
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let reason: String = row.get("reason");
                let direction: Option<String> = row.get("direction");
                Ok(PriceRecord {
                    rate: row.get("rate"),
                    timestamp: row.get("recorded_at"),
                    reason: reason.parse().map_err(SettlerError::Storage)?,
                    volume: row.get("volume"),
                    direction: direction
                        .map(|d| d.parse())
                        .transpose()
                        .map_err(SettlerError::Storage)?,
                })
            })
            .collect()
    }

    /// Health check
    async fn health_check(&self) -> SettlerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SettlerError::Database)?;
        Ok(())
    }
}

fn intent_from_row(row: &PgRow) -> SettlerResult<Intent> {
    let direction: String = row.get("direction");
    let status: String = row.get("status");
    let attempts: i32 = row.get("dispatch_attempts");

    Ok(Intent {
        id: row.get("id"),
        direction: direction.parse().map_err(SettlerError::Storage)?,
        source_address: row.get("source_address"),
        source_tx_hash: row.get("source_tx_hash"),
        amount_in: row.get("amount_in"),
        target_address: row.get("target_address"),
        target_tx_hash: row.get("target_tx_hash"),
        amount_out: row.get("amount_out"),
        quoted_amount_out: row.get("quoted_amount_out"),
        min_amount_out: row.get("min_amount_out"),
        status: status.parse().map_err(SettlerError::Storage)?,
        expiry: row.get("expiry"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        fulfilled_at: row.get("fulfilled_at"),
        error: row.get("error"),
        payout_reference: row.get("payout_reference"),
        dispatch_attempts: attempts.max(0) as u32,
        payload: row.get("payload"),
    })
}
