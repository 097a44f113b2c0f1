//! The alert lifecycle engine: single consumer of the inbound event
//! channel, owner of the clear-holddown map and the processor pipeline
//! input, host of the expiry and escalation housekeepers.
//!
//! Every inbound event is handled inside its own store transaction;
//! per-event failures roll back, are logged and counted, and never
//! terminate the loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clearer::ClearHolddown;
use crate::config::ConfigHandle;
use crate::models::{to_chrono, Alert, AlertEvent, EventType, Labels, SuppressionRule};
use crate::models::{MatchCondition, Status};
use crate::notifier::Notifier;
use crate::pipeline::ProcessorPipeline;
use crate::stats::{Counter, StatsRegistry};
use crate::store::{Store, StoreError, Txn};
use crate::suppressor::Suppressor;
use crate::transform::TransformRegistry;

pub const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const ESCALATION_CHECK_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Capacity of the channel feeding the processor pipeline.
const PROC_CHANNEL_CAPACITY: usize = 64;

pub struct AlertEngine {
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    suppressor: Arc<Suppressor>,
    transforms: TransformRegistry,
    config: ConfigHandle,
    clearer: Arc<ClearHolddown>,
    shutdown: CancellationToken,
    proc_tx: Mutex<Option<mpsc::Sender<AlertEvent>>>,
    stat_db_errors: Counter,
    stat_transform_errors: Counter,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<Notifier>,
        suppressor: Arc<Suppressor>,
        transforms: TransformRegistry,
        config: ConfigHandle,
        stats: &StatsRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        AlertEngine {
            store,
            notifier,
            suppressor,
            transforms,
            config,
            clearer: Arc::new(ClearHolddown::new()),
            shutdown,
            proc_tx: Mutex::new(None),
            stat_db_errors: stats.counter("handler.db_errors"),
            stat_transform_errors: stats.counter("handler.transform_errors"),
        }
    }

    pub fn clearer(&self) -> &ClearHolddown {
        &self.clearer
    }

    /// Start the pipeline and housekeeping, then consume the listen
    /// channel until shutdown. Cancellation closes the pipeline input,
    /// which cascades through the stages.
    pub async fn run(self: Arc<Self>, mut listen_rx: mpsc::Receiver<AlertEvent>, pipeline: ProcessorPipeline) {
        if !pipeline.is_empty() {
            let (proc_tx, proc_rx) = mpsc::channel(PROC_CHANNEL_CAPACITY);
            *lock(&self.proc_tx) = Some(proc_tx);
            pipeline
                .run(self.shutdown.clone(), self.store.clone(), proc_rx)
                .await;
        }

        let housekeeper = self.clone();
        tokio::spawn(async move { housekeeper.run_housekeeping().await });

        loop {
            tokio::select! {
                maybe = listen_rx.recv() => {
                    let Some(event) = maybe else { break };
                    self.clone().handle_event(event).await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
        debug!("closing engine listen loop");
        lock(&self.proc_tx).take();
    }

    /// Dispatch one inbound event inside its own transaction.
    pub(crate) async fn handle_event(self: Arc<Self>, event: AlertEvent) {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("unable to open transaction: {e}");
                self.stat_db_errors.add(1);
                return;
            }
        };
        let result = match event.event_type {
            EventType::Active => self.handle_active(tx.as_mut(), event.alert).await,
            EventType::Cleared => {
                let holddown = self.config.snapshot().general.clear_holddown_interval;
                self.clone().handle_clear(tx.as_mut(), event.alert, holddown).await
            }
            other => {
                debug!("ignoring inbound {other} event");
                Ok(())
            }
        };
        match result {
            Ok(()) => {
                if let Err(e) = tx.commit().await {
                    error!("commit failed: {e}");
                    self.stat_db_errors.add(1);
                }
            }
            Err(e) => {
                error!("unable to handle alert: {e}");
                self.stat_db_errors.add(1);
                if let Err(e) = tx.rollback().await {
                    error!("rollback failed: {e}");
                }
            }
        }
    }

    async fn handle_active(&self, tx: &mut dyn Txn, mut alert: Alert) -> Result<(), StoreError> {
        if alert.team.is_empty() {
            alert.team = self.config.snapshot().agent.team_name.clone();
        }
        if self.check_existing(tx, &alert).await? {
            return Ok(());
        }
        self.apply_transforms(&mut alert);
        alert.extend_labels();
        if let Some(rule) = self.suppressor.match_labels(&alert.labels) {
            debug!(
                "found matching suppression rule for {}:{}: {}:{}",
                alert.name, alert.entity, rule.id, rule.name
            );
            return Ok(());
        }
        let config = self.config.snapshot();
        if let Some(alert_config) = config.alert_config(&alert.name) {
            alert.auto_clear = alert_config.auto_clear;
            if let Some(expire_after) = alert_config.auto_expire {
                alert.auto_clear_at = Some(Utc::now() + to_chrono(expire_after));
            }
        }
        let id = tx.insert_alert(&alert).await?;
        alert.id = id;
        debug!("received alert with id {id}");
        tx.insert_record(
            id,
            &format!(
                "Alert created from source {} with severity {}",
                alert.source, alert.severity
            ),
        )
        .await?;
        self.notify_receivers(alert, EventType::Active).await;
        Ok(())
    }

    /// True when the alert already exists: its activity window extends
    /// (together with its parent aggregate's) and any pending clear is
    /// cancelled.
    async fn check_existing(&self, tx: &mut dyn Txn, alert: &Alert) -> Result<bool, StoreError> {
        let Some(existing) = self.get_existing(tx, alert).await? else {
            debug!("no existing alert found for {}:{}", alert.name, alert.entity);
            return Ok(false);
        };
        let mut ids = vec![existing.id];
        if existing.has_aggregate() {
            ids.push(existing.agg_id);
        }
        tx.update_last_active(&ids, Utc::now()).await?;
        if let Some(pending_clear) = self.clearer.get(existing.id) {
            pending_clear.cancel();
        }
        Ok(true)
    }

    async fn handle_clear(
        self: Arc<Self>,
        tx: &mut dyn Txn,
        alert: Alert,
        holddown: Duration,
    ) -> Result<(), StoreError> {
        let Some(existing) = self.get_existing(tx, &alert).await? else {
            debug!(
                "no existing alert found for {}:{} to clear",
                alert.name, alert.entity
            );
            return Ok(());
        };
        if !existing.auto_clear {
            debug!("not auto-clearing alert {}", existing.id);
            return Ok(());
        }
        if holddown.is_zero() {
            return self.clear_alert(tx, existing).await;
        }
        self.spawn_holddown(existing, holddown);
        Ok(())
    }

    /// Wait out the holddown, then clear in a fresh transaction. A
    /// reactivation (or shutdown) cancels the wait; cancel wins when
    /// both are ready.
    fn spawn_holddown(self: Arc<Self>, alert: Alert, holddown: Duration) {
        let (cancel, generation) = self.clearer.add(alert.id, &self.shutdown);
        let engine = self;
        tokio::spawn(async move {
            let _guard = HolddownGuard {
                clearer: engine.clearer.clone(),
                id: alert.id,
                generation,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("clear of alert {} cancelled", alert.id);
                }
                _ = tokio::time::sleep(holddown) => {
                    let mut tx = match engine.store.begin().await {
                        Ok(tx) => tx,
                        Err(e) => {
                            error!("unable to open clear transaction: {e}");
                            engine.stat_db_errors.add(1);
                            return;
                        }
                    };
                    match engine.clear_alert(tx.as_mut(), alert).await {
                        Ok(()) => {
                            if let Err(e) = tx.commit().await {
                                error!("clear commit failed: {e}");
                                engine.stat_db_errors.add(1);
                            }
                        }
                        Err(e) => {
                            error!("cannot clear existing alert: {e}");
                            engine.stat_db_errors.add(1);
                            let _ = tx.rollback().await;
                        }
                    }
                }
            }
        });
    }

    /// Set the alert cleared. Idempotent against rows another path
    /// already closed, so an orphaned holddown timer is harmless.
    pub async fn clear_alert(&self, tx: &mut dyn Txn, mut alert: Alert) -> Result<(), StoreError> {
        match tx.get_alert(alert.id).await? {
            Some(current) if !current.status.is_terminal() => {}
            _ => return Ok(()),
        }
        alert.clear();
        tx.set_status(alert.id, Status::Cleared).await?;
        tx.insert_record(alert.id, "Alert cleared").await?;
        self.notify_receivers(alert, EventType::Cleared).await;
        Ok(())
    }

    async fn get_existing(
        &self,
        tx: &mut dyn Txn,
        alert: &Alert,
    ) -> Result<Option<Alert>, StoreError> {
        if alert.id > 0 {
            tx.get_alert(alert.id).await
        } else {
            tx.get_alert_by_identity(&alert.name, &alert.entity, alert.device.as_deref())
                .await
        }
    }

    fn apply_transforms(&self, alert: &mut Alert) {
        for transform in self.transforms.matching(&alert.name) {
            debug!(
                "applying transform {} to alert {}",
                transform.name(),
                alert.name
            );
            if let Err(e) = transform.apply(alert) {
                error!(
                    "failed to apply transform {} to alert {}: {e}",
                    transform.name(),
                    alert.name
                );
                self.stat_transform_errors.add(1);
            }
        }
    }

    /// Fan the event out: synchronously into the processor pipeline
    /// (its bounded buffer is the engine's backpressure) and without
    /// blocking to the notifier.
    async fn notify_receivers(&self, alert: Alert, event_type: EventType) {
        let event = AlertEvent::new(alert, event_type);
        let sender = lock(&self.proc_tx).clone();
        if let Some(proc_tx) = sender {
            if proc_tx.send(event.clone()).await.is_err() {
                debug!("processor pipeline closed, skipping");
            }
        }
        self.notifier.notify(event);
    }

    async fn run_housekeeping(self: Arc<Self>) {
        let mut expiry = tokio::time::interval_at(
            tokio::time::Instant::now() + EXPIRY_CHECK_INTERVAL,
            EXPIRY_CHECK_INTERVAL,
        );
        let mut escalation = tokio::time::interval_at(
            tokio::time::Instant::now() + ESCALATION_CHECK_INTERVAL,
            ESCALATION_CHECK_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = expiry.tick() => self.handle_expiry().await,
                _ = escalation.tick() => self.handle_escalation().await,
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    /// Expire alerts whose deadline passed. Aggregates own their own
    /// lifecycle and children follow their aggregate, so both are
    /// skipped here.
    pub(crate) async fn handle_expiry(&self) {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("unable to open expiry transaction: {e}");
                self.stat_db_errors.add(1);
                return;
            }
        };
        match self.expire_alerts(tx.as_mut()).await {
            Ok(()) => {
                if let Err(e) = tx.commit().await {
                    error!("expiry commit failed: {e}");
                    self.stat_db_errors.add(1);
                }
            }
            Err(e) => {
                error!("failed to update expired alerts: {e}");
                self.stat_db_errors.add(1);
                let _ = tx.rollback().await;
            }
        }
    }

    async fn expire_alerts(&self, tx: &mut dyn Txn) -> Result<(), StoreError> {
        for mut expired in tx.select_expired(Utc::now()).await? {
            if expired.is_aggregate || expired.has_aggregate() {
                continue;
            }
            debug!("alert {} has now expired", expired.id);
            expired.status = Status::Expired;
            tx.update_alert(&expired).await?;
            tx.insert_record(expired.id, "Alert expired").await?;
            self.notify_receivers(expired, EventType::Expired).await;
        }
        Ok(())
    }

    pub(crate) async fn handle_escalation(&self) {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("unable to open escalation transaction: {e}");
                self.stat_db_errors.add(1);
                return;
            }
        };
        match self.escalate_alerts(tx.as_mut()).await {
            Ok(()) => {
                if let Err(e) = tx.commit().await {
                    error!("escalation commit failed: {e}");
                    self.stat_db_errors.add(1);
                }
            }
            Err(e) => {
                error!("failed to escalate alerts: {e}");
                self.stat_db_errors.add(1);
                let _ = tx.rollback().await;
            }
        }
    }

    /// Walk each un-owned alert's escalation rules in declared order;
    /// the first rule whose threshold has passed and whose target
    /// outranks the current severity wins.
    async fn escalate_alerts(&self, tx: &mut dyn Txn) -> Result<(), StoreError> {
        let config = self.config.snapshot();
        for mut alert in tx.select_unowned().await? {
            let Some(alert_config) = config.alert_config(&alert.name) else {
                debug!("no config found for {}, skipping escalation", alert.name);
                continue;
            };
            let mut changed = false;
            for rule in &alert_config.escalation_rules {
                if !rule.escalate_to.is_more_severe_than(alert.severity) {
                    continue;
                }
                let elapsed = (Utc::now() - alert.start_time).to_std().unwrap_or_default();
                if elapsed >= rule.after {
                    info!(
                        "escalating alert {}:{} to {}",
                        alert.name, alert.id, rule.escalate_to
                    );
                    alert.severity = rule.escalate_to;
                    tx.update_alert(&alert).await?;
                    tx.insert_record(
                        alert.id,
                        &format!("Alert severity escalated to {}", rule.escalate_to),
                    )
                    .await?;
                    changed = true;
                    break;
                }
            }
            if changed {
                self.notify_receivers(alert, EventType::Escalated).await;
            }
        }
        Ok(())
    }

    /// Suppress an alert on user request and synthesize a rule so
    /// similar alerts stay silenced for the duration.
    pub async fn suppress(
        &self,
        tx: &mut dyn Txn,
        mut alert: Alert,
        creator: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<(), StoreError> {
        self.suppressor
            .suppress_alert(tx, &mut alert, duration)
            .await?;
        let mut entities = Labels::new();
        entities.insert("alert_name".to_string(), serde_json::json!(alert.name));
        entities.insert("entity".to_string(), serde_json::json!(alert.entity));
        if let Some(device) = &alert.device {
            entities.insert("device".to_string(), serde_json::json!(device));
        }
        let rule = SuppressionRule::new(
            format!("alert-{}", alert.id),
            entities,
            MatchCondition::All,
            reason,
            "alert_manager",
            duration,
        );
        self.suppressor.save_rule(tx, rule).await?;
        tx.insert_record(
            alert.id,
            &format!(
                "Alert suppressed by {creator} for {}s: {reason}",
                duration.as_secs()
            ),
        )
        .await?;
        self.notify_receivers(alert, EventType::Suppressed).await;
        Ok(())
    }

    /// Acknowledge: record the owner and team, keep the alert out of
    /// escalation.
    pub async fn set_owner(
        &self,
        tx: &mut dyn Txn,
        mut alert: Alert,
        owner: &str,
        team: &str,
    ) -> Result<(), StoreError> {
        alert.set_owner(owner, team);
        tx.update_alert(&alert).await?;
        tx.insert_record(
            alert.id,
            &format!("Alert owner set to {owner}, team set to {team}"),
        )
        .await?;
        self.notify_receivers(alert, EventType::Acked).await;
        Ok(())
    }

    pub async fn add_supp_rule(
        &self,
        tx: &mut dyn Txn,
        rule: SuppressionRule,
    ) -> Result<i64, StoreError> {
        self.suppressor.save_rule(tx, rule).await
    }

    pub async fn delete_supp_rule(&self, tx: &mut dyn Txn, id: i64) -> Result<(), StoreError> {
        self.suppressor.delete_rule(tx, id).await
    }
}

/// Removes the holddown entry on every exit path of its task.
struct HolddownGuard {
    clearer: Arc<ClearHolddown>,
    id: i64,
    generation: u64,
}

impl Drop for HolddownGuard {
    fn drop(&mut self) {
        self.clearer.remove(self.id, self.generation);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
