//! Transactional persistence of alerts, history records, and
//! suppression rules.
//!
//! The engine only ever talks to the [`Store`] and [`Txn`] traits; the
//! Postgres implementation lives in [`postgres`], and tests (plus the
//! `--memory-store` escape hatch) use [`memory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Alert, HistoryRecord, Status, SuppressionRule};

pub mod memory;
pub mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Insert would violate identity uniqueness among non-terminal
    /// alerts.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Txn>, StoreError>;
}

/// A single transaction. All engine work happens inside one; `commit`
/// and `rollback` consume it.
#[async_trait]
pub trait Txn: Send {
    /// Insert a new alert and return its assigned id.
    async fn insert_alert(&mut self, alert: &Alert) -> Result<i64, StoreError>;

    async fn update_alert(&mut self, alert: &Alert) -> Result<(), StoreError>;

    async fn set_status(&mut self, id: i64, status: Status) -> Result<(), StoreError>;

    /// Extend `last_active` on every listed alert in one statement; the
    /// list carries the alert plus its parent aggregate when linked.
    async fn update_last_active(
        &mut self,
        ids: &[i64],
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_alert(&mut self, id: i64) -> Result<Option<Alert>, StoreError>;

    /// Look up a non-terminal alert by identity. The device-less form
    /// matches only rows without a device.
    async fn get_alert_by_identity(
        &mut self,
        name: &str,
        entity: &str,
        device: Option<&str>,
    ) -> Result<Option<Alert>, StoreError>;

    /// Active or suppressed alerts whose `auto_clear_at` has passed.
    async fn select_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<Alert>, StoreError>;

    /// Active alerts nobody has acknowledged.
    async fn select_unowned(&mut self) -> Result<Vec<Alert>, StoreError>;

    async fn select_active_by_name(&mut self, name: &str) -> Result<Vec<Alert>, StoreError>;

    async fn insert_record(&mut self, alert_id: i64, event: &str) -> Result<(), StoreError>;

    async fn select_records(&mut self, alert_id: i64) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Insert a suppression rule and return its assigned id.
    async fn insert_rule(&mut self, rule: &SuppressionRule) -> Result<i64, StoreError>;

    async fn delete_rule(&mut self, id: i64) -> Result<(), StoreError>;

    async fn select_rules(&mut self) -> Result<Vec<SuppressionRule>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
