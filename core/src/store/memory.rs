//! In-memory store with snapshot transactions.
//!
//! Each transaction clones the shared state, applies its writes to the
//! clone, and swaps the clone back on commit. That is enough isolation
//! for a single-writer engine and keeps the lifecycle tests hermetic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Alert, HistoryRecord, Status, SuppressionRule};
use crate::store::{Store, StoreError, Txn};

#[derive(Debug, Clone, Default)]
struct MemState {
    alerts: BTreeMap<i64, Alert>,
    records: Vec<HistoryRecord>,
    rules: BTreeMap<i64, SuppressionRule>,
    next_alert_id: i64,
    next_rule_id: i64,
    next_record_id: i64,
}

#[derive(Debug, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Committed view of a single alert.
    pub fn alert(&self, id: i64) -> Option<Alert> {
        self.lock().alerts.get(&id).cloned()
    }

    /// Committed view of all alerts, id-ordered.
    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.values().cloned().collect()
    }

    pub fn records_for(&self, alert_id: i64) -> Vec<HistoryRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.alert_id == alert_id)
            .cloned()
            .collect()
    }

    pub fn rules(&self) -> Vec<SuppressionRule> {
        self.lock().rules.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self) -> Result<Box<dyn Txn>, StoreError> {
        let staged = self.lock().clone();
        Ok(Box::new(MemTxn {
            shared: self.state.clone(),
            staged,
        }))
    }
}

struct MemTxn {
    shared: Arc<Mutex<MemState>>,
    staged: MemState,
}

impl MemTxn {
    fn identity_conflict(&self, alert: &Alert) -> bool {
        self.staged.alerts.values().any(|existing| {
            !existing.status.is_terminal()
                && existing.name == alert.name
                && existing.entity == alert.entity
                && existing.device == alert.device
                && existing.team == alert.team
        })
    }
}

#[async_trait]
impl Txn for MemTxn {
    async fn insert_alert(&mut self, alert: &Alert) -> Result<i64, StoreError> {
        if self.identity_conflict(alert) {
            return Err(StoreError::Conflict(format!(
                "alert {}:{} already open",
                alert.name, alert.entity
            )));
        }
        self.staged.next_alert_id += 1;
        let id = self.staged.next_alert_id;
        let mut stored = alert.clone();
        stored.id = id;
        self.staged.alerts.insert(id, stored);
        Ok(id)
    }

    async fn update_alert(&mut self, alert: &Alert) -> Result<(), StoreError> {
        match self.staged.alerts.get_mut(&alert.id) {
            Some(slot) => {
                *slot = alert.clone();
                Ok(())
            }
            None => Err(StoreError::Internal(format!(
                "no alert with id {}",
                alert.id
            ))),
        }
    }

    async fn set_status(&mut self, id: i64, status: Status) -> Result<(), StoreError> {
        match self.staged.alerts.get_mut(&id) {
            Some(alert) => {
                alert.status = status;
                Ok(())
            }
            None => Err(StoreError::Internal(format!("no alert with id {id}"))),
        }
    }

    async fn update_last_active(
        &mut self,
        ids: &[i64],
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for id in ids {
            if let Some(alert) = self.staged.alerts.get_mut(id) {
                alert.last_active = ts;
            }
        }
        Ok(())
    }

    async fn get_alert(&mut self, id: i64) -> Result<Option<Alert>, StoreError> {
        Ok(self.staged.alerts.get(&id).cloned())
    }

    async fn get_alert_by_identity(
        &mut self,
        name: &str,
        entity: &str,
        device: Option<&str>,
    ) -> Result<Option<Alert>, StoreError> {
        Ok(self
            .staged
            .alerts
            .values()
            .find(|a| {
                !a.status.is_terminal()
                    && a.name == name
                    && a.entity == entity
                    && a.device.as_deref() == device
            })
            .cloned())
    }

    async fn select_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .staged
            .alerts
            .values()
            .filter(|a| {
                matches!(a.status, Status::Active | Status::Suppressed)
                    && a.auto_clear_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect())
    }

    async fn select_unowned(&mut self) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .staged
            .alerts
            .values()
            .filter(|a| a.status == Status::Active && a.owner.is_none())
            .cloned()
            .collect())
    }

    async fn select_active_by_name(&mut self, name: &str) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .staged
            .alerts
            .values()
            .filter(|a| a.status == Status::Active && a.name == name)
            .cloned()
            .collect())
    }

    async fn insert_record(&mut self, alert_id: i64, event: &str) -> Result<(), StoreError> {
        self.staged.next_record_id += 1;
        self.staged.records.push(HistoryRecord {
            id: self.staged.next_record_id,
            alert_id,
            timestamp: Utc::now(),
            event: event.to_string(),
        });
        Ok(())
    }

    async fn select_records(&mut self, alert_id: i64) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self
            .staged
            .records
            .iter()
            .filter(|r| r.alert_id == alert_id)
            .cloned()
            .collect())
    }

    async fn insert_rule(&mut self, rule: &SuppressionRule) -> Result<i64, StoreError> {
        self.staged.next_rule_id += 1;
        let id = self.staged.next_rule_id;
        let mut stored = rule.clone();
        stored.id = id;
        self.staged.rules.insert(id, stored);
        Ok(id)
    }

    async fn delete_rule(&mut self, id: i64) -> Result<(), StoreError> {
        self.staged.rules.remove(&id);
        Ok(())
    }

    async fn select_rules(&mut self) -> Result<Vec<SuppressionRule>, StoreError> {
        Ok(self.staged.rules.values().cloned().collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut shared = self
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *shared = self.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use pretty_assertions::assert_eq;

    fn alert(name: &str, entity: &str, device: Option<&str>) -> Alert {
        let mut a = Alert::new(name, "test", entity, Severity::Info);
        a.device = device.map(str::to_string);
        a
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = MemStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_alert(&alert("BGP Down", "r1", None)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.alerts().is_empty());
    }

    #[tokio::test]
    async fn identity_uniqueness_among_non_terminal() {
        let store = MemStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_alert(&alert("BGP Down", "r1", Some("d1"))).await.unwrap();
        assert!(tx
            .insert_alert(&alert("BGP Down", "r1", Some("d1")))
            .await
            .is_err());
        // same name+entity, different device: distinct identity
        tx.insert_alert(&alert("BGP Down", "r1", Some("d2"))).await.unwrap();
        // terminal rows free the identity for a fresh insert
        tx.set_status(id, Status::Cleared).await.unwrap();
        tx.insert_alert(&alert("BGP Down", "r1", Some("d1"))).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.alerts().len(), 3);
    }

    #[tokio::test]
    async fn identity_lookup_distinguishes_device() {
        let store = MemStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_alert(&alert("BGP Down", "r1", Some("d1"))).await.unwrap();
        let found = tx
            .get_alert_by_identity("BGP Down", "r1", Some("d1"))
            .await
            .unwrap();
        assert!(found.is_some());
        let missing = tx.get_alert_by_identity("BGP Down", "r1", None).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn expired_selection_honors_status_and_deadline() {
        let store = MemStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut due = alert("A", "e1", None);
        due.auto_clear_at = Some(Utc::now() - chrono::Duration::seconds(10));
        let due_id = tx.insert_alert(&due).await.unwrap();
        let mut not_due = alert("B", "e2", None);
        not_due.auto_clear_at = Some(Utc::now() + chrono::Duration::seconds(600));
        tx.insert_alert(&not_due).await.unwrap();
        let expired = tx.select_expired(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, due_id);
    }
}
