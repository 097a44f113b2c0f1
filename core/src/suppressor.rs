//! Rule-based silencing. The suppressor owns an in-memory cache of
//! suppression rules, seeded from config and read through from the
//! store at startup; writes go to the store first, then the cache.

use std::sync::RwLock;
use std::time::Duration;

use tracing::debug;

use crate::models::{Alert, Labels, MatchCondition, SuppressionRule};
use crate::store::{StoreError, Txn};

#[derive(Default)]
pub struct Suppressor {
    rules: RwLock<Vec<SuppressionRule>>,
}

impl Suppressor {
    pub fn new() -> Self {
        Suppressor::default()
    }

    /// Install config-seeded rules. Seeds carry no id; they are cache
    /// only and expire with their duration like any other rule.
    pub fn seed(&self, rules: Vec<SuppressionRule>) {
        let mut cache = self.write();
        cache.extend(rules);
    }

    /// Pull persisted rules into the cache.
    pub async fn load(&self, tx: &mut dyn Txn) -> Result<(), StoreError> {
        let persisted = tx.select_rules().await?;
        let mut cache = self.write();
        cache.retain(|r| r.id == 0);
        cache.extend(persisted);
        debug!("suppressor loaded {} persisted rules", cache.len());
        Ok(())
    }

    /// First live rule matching `labels`, lowest rule id first so the
    /// winner is stable across reloads.
    pub fn match_labels(&self, labels: &Labels) -> Option<SuppressionRule> {
        let mut live: Vec<SuppressionRule> = self
            .read()
            .iter()
            .filter(|r| r.is_live())
            .cloned()
            .collect();
        live.sort_by_key(|r| r.id);
        live.into_iter().find(|r| rule_matches(r, labels))
    }

    /// Mark the alert suppressed until `now + duration` and persist.
    pub async fn suppress_alert(
        &self,
        tx: &mut dyn Txn,
        alert: &mut Alert,
        duration: Duration,
    ) -> Result<(), StoreError> {
        alert.suppress(duration);
        tx.update_alert(alert).await
    }

    pub async fn save_rule(
        &self,
        tx: &mut dyn Txn,
        mut rule: SuppressionRule,
    ) -> Result<i64, StoreError> {
        let id = tx.insert_rule(&rule).await?;
        rule.id = id;
        self.write().push(rule);
        Ok(id)
    }

    pub async fn delete_rule(&self, tx: &mut dyn Txn, id: i64) -> Result<(), StoreError> {
        tx.delete_rule(id).await?;
        self.write().retain(|r| r.id != id);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<SuppressionRule>> {
        self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<SuppressionRule>> {
        self.rules.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An empty entity mapping never matches; a rule with no constraints
/// would otherwise silence everything.
fn rule_matches(rule: &SuppressionRule, labels: &Labels) -> bool {
    if rule.entities.is_empty() {
        return false;
    }
    match rule.match_condition {
        MatchCondition::All => rule
            .entities
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v)),
        MatchCondition::Any => rule
            .entities
            .iter()
            .any(|(k, v)| labels.get(k) == Some(v)),
    }
}
