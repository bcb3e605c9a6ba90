//! Delivery ledger: the durable record of which events were notified.
//!
//! `mark_sent` is a conditional write (`sent_at` set only while null), so
//! concurrent or repeated calls for one event converge on a single record.

pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::LedgerError;

pub use postgres::PostgresLedger;

/// Result of recording a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call set `sent_at`.
    Applied,
    /// `sent_at` was already set; nothing changed.
    AlreadyApplied,
}

/// Store of delivery state keyed by event id.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Record the event as sent, atomically and at most once.
    async fn mark_sent(&self, event_id: &str) -> Result<MarkOutcome, LedgerError>;

    /// Whether the event is already recorded as sent.
    async fn is_sent(&self, event_id: &str) -> Result<bool, LedgerError> {
        Ok(self.sent_at(event_id).await?.is_some())
    }

    /// When the event was recorded as sent, if it was.
    async fn sent_at(&self, event_id: &str) -> Result<Option<DateTime<Utc>>, LedgerError>;
}

/// Ledger kept in process memory.
#[derive(Default)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<String, Option<DateTime<Utc>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events recorded as sent.
    pub async fn sent_count(&self) -> usize {
        self.records
            .lock()
            .await
            .values()
            .filter(|sent| sent.is_some())
            .count()
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryLedger {
    async fn mark_sent(&self, event_id: &str) -> Result<MarkOutcome, LedgerError> {
        let mut records = self.records.lock().await;
        let sent_at = records.entry(event_id.to_string()).or_insert(None);
        if sent_at.is_some() {
            return Ok(MarkOutcome::AlreadyApplied);
        }
        *sent_at = Some(Utc::now());
        Ok(MarkOutcome::Applied)
    }

    async fn sent_at(&self, event_id: &str) -> Result<Option<DateTime<Utc>>, LedgerError> {
        Ok(self.records.lock().await.get(event_id).copied().flatten())
    }
}
