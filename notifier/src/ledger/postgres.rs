//! PostgreSQL delivery ledger.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use super::{DeliveryLedger, MarkOutcome};
use crate::error::LedgerError;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notification (
    event_id TEXT PRIMARY KEY,
    sent_at  TIMESTAMPTZ NULL
)
"#;

/// Inserts the record as sent, or fills `sent_at` only if it is still null.
/// Zero affected rows means another attempt already recorded the send.
const MARK_SENT: &str = r#"
INSERT INTO notification (event_id, sent_at)
VALUES ($1, NOW())
ON CONFLICT (event_id) DO UPDATE
    SET sent_at = EXCLUDED.sent_at
    WHERE notification.sent_at IS NULL
"#;

/// Ledger backed by the `notification` table.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool and make sure the table exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        info!(max_connections, "ledger_connected");

        let ledger = Self::new(pool);
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryLedger for PostgresLedger {
    async fn mark_sent(&self, event_id: &str) -> Result<MarkOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(MARK_SENT)
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if result.rows_affected() == 1 {
            Ok(MarkOutcome::Applied)
        } else {
            Ok(MarkOutcome::AlreadyApplied)
        }
    }

    async fn sent_at(&self, event_id: &str) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let row: Option<(Option<DateTime<Utc>>,)> =
            sqlx::query_as("SELECT sent_at FROM notification WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(sent_at,)| sent_at))
    }
}
