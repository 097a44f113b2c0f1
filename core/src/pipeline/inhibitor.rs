//! Inhibitor stage: silences downstream alerts while a designated
//! upstream alert is active.
//!
//! Candidate targets are buffered per rule; on each check tick the
//! stage looks up active source alerts and suppresses every buffered
//! target whose cross-reference label points at a source's device.
//! Everything else flushes downstream unchanged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Config, ConfigHandle, InhibitRule};
use crate::models::{Alert, AlertEvent, EventType};
use crate::pipeline::{send_or_cancelled, Processor, STAGE_CHANNEL_CAPACITY};
use crate::stats::{Counter, StatsRegistry};
use crate::store::Store;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(120);

pub struct Inhibitor {
    config: ConfigHandle,
    buffers: Mutex<HashMap<String, Vec<AlertEvent>>>,
    inhibited: Counter,
    errors: Counter,
}

impl Inhibitor {
    pub fn new(config: ConfigHandle, stats: &StatsRegistry) -> Self {
        Inhibitor {
            config,
            buffers: Mutex::new(HashMap::new()),
            inhibited: stats.counter("inhibitor.alerts_inhibited"),
            errors: stats.counter("inhibitor.errors"),
        }
    }

    /// Rule that wants to hold this alert back, if any. Keys are walked
    /// in sorted order so routing is stable.
    fn route(config: &Config, alert_name: &str) -> Option<String> {
        let mut names: Vec<&String> = config.inhibit_rules.keys().collect();
        names.sort();
        names
            .into_iter()
            .find(|name| {
                config.inhibit_rules[*name]
                    .target_matches
                    .iter()
                    .any(|t| t.alert_name == alert_name)
            })
            .cloned()
    }

    fn buffer(&self, rule_name: &str, event: AlertEvent) {
        debug!(
            "inhibitor buffering alert {} under rule {rule_name}",
            event.alert.name
        );
        lock(&self.buffers)
            .entry(rule_name.to_string())
            .or_default()
            .push(event);
    }

    fn take_buffer(&self, rule_name: &str) -> Vec<AlertEvent> {
        lock(&self.buffers).remove(rule_name).unwrap_or_default()
    }

    fn rebuffer(&self, rule_name: &str, events: Vec<AlertEvent>) {
        lock(&self.buffers)
            .entry(rule_name.to_string())
            .or_default()
            .extend(events);
    }

    pub(crate) fn buffered(&self, rule_name: &str) -> usize {
        lock(&self.buffers).get(rule_name).map_or(0, Vec::len)
    }

    /// Run one inhibition check for `rule`: suppress buffered targets
    /// cross-referencing an active source, flush the rest downstream.
    /// On a store error the whole batch goes back in the buffer for the
    /// next tick.
    async fn check_rule(
        &self,
        token: &CancellationToken,
        store: &Arc<dyn Store>,
        out: &mpsc::Sender<AlertEvent>,
        rule_name: &str,
        rule: &InhibitRule,
    ) {
        let buffered = self.take_buffer(rule_name);
        if buffered.is_empty() {
            return;
        }
        match self.apply_rule(store, rule, buffered.clone()).await {
            Ok(flush) => {
                for event in flush {
                    if !send_or_cancelled(out, token, event).await {
                        return;
                    }
                }
            }
            Err(e) => {
                error!("inhibitor check for rule {rule_name} failed: {e}");
                self.errors.add(1);
                self.rebuffer(rule_name, buffered);
            }
        }
    }

    async fn apply_rule(
        &self,
        store: &Arc<dyn Store>,
        rule: &InhibitRule,
        events: Vec<AlertEvent>,
    ) -> Result<Vec<AlertEvent>, crate::store::StoreError> {
        let mut tx = store.begin().await?;
        let sources = tx
            .select_active_by_name(&rule.source_match.alert_name)
            .await?;
        let mut flush = Vec::new();
        for mut event in events {
            match matching_source(rule, &event.alert, &sources) {
                Some(source) => {
                    event.alert.suppress(rule.duration);
                    tx.update_alert(&event.alert).await?;
                    tx.insert_record(
                        event.alert.id,
                        &format!(
                            "Alert inhibited by active alert {}:{}",
                            source.name, source.id
                        ),
                    )
                    .await?;
                    info!(
                        "inhibited alert {}:{} due to {}",
                        event.alert.name, event.alert.id, source.name
                    );
                    self.inhibited.add(1);
                }
                None => flush.push(event),
            }
        }
        tx.commit().await?;
        Ok(flush)
    }
}

/// The source alert whose device the target's cross-reference label
/// points at, if the rule names such a label for this target.
fn matching_source<'a>(
    rule: &InhibitRule,
    alert: &Alert,
    sources: &'a [Alert],
) -> Option<&'a Alert> {
    let target = rule
        .target_matches
        .iter()
        .find(|t| t.alert_name == alert.name)?;
    let value = alert.labels.get(&target.label)?.as_str()?;
    sources
        .iter()
        .find(|s| s.device.as_deref() == Some(value))
}

fn lock(
    buffers: &Mutex<HashMap<String, Vec<AlertEvent>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, Vec<AlertEvent>>> {
    buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Processor for Inhibitor {
    fn name(&self) -> &str {
        "inhibitor"
    }

    fn stage(&self) -> usize {
        1
    }

    async fn process(
        self: Arc<Self>,
        token: CancellationToken,
        store: Arc<dyn Store>,
        mut input: mpsc::Receiver<AlertEvent>,
    ) -> mpsc::Receiver<AlertEvent> {
        let (tx, rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let check_interval = self
            .config
            .snapshot()
            .inhibit_rules
            .values()
            .map(|r| r.delay)
            .min()
            .unwrap_or(DEFAULT_CHECK_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + check_interval,
                check_interval,
            );
            loop {
                tokio::select! {
                    maybe = input.recv() => {
                        let Some(event) = maybe else { break };
                        let config = self.config.snapshot();
                        match Inhibitor::route(&config, &event.alert.name) {
                            Some(rule_name) if event.event_type == EventType::Active => {
                                self.buffer(&rule_name, event);
                            }
                            _ => {
                                if !send_or_cancelled(&tx, &token, event).await {
                                    return;
                                }
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        let config = self.config.snapshot();
                        let mut names: Vec<&String> = config.inhibit_rules.keys().collect();
                        names.sort();
                        for name in names {
                            self.check_rule(&token, &store, &tx, name, &config.inhibit_rules[name])
                                .await;
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            // final sweep so buffered alerts are not lost on shutdown
            let config = self.config.snapshot();
            let mut names: Vec<&String> = config.inhibit_rules.keys().collect();
            names.sort();
            for name in names {
                for event in self.take_buffer(name) {
                    if !send_or_cancelled(&tx, &token, event).await {
                        return;
                    }
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceMatch, TargetMatch};
    use crate::models::{Severity, Status};
    use crate::store::{MemStore, Store};
    use crate::testutil::{labels_of, mock_alert};
    use pretty_assertions::assert_eq;

    fn device_down_rule() -> InhibitRule {
        InhibitRule {
            source_match: SourceMatch { alert_name: "Neteng Device Down".to_string() },
            target_matches: vec![
                TargetMatch {
                    alert_name: "Neteng BGP Down".to_string(),
                    label: "RemoteDeviceName".to_string(),
                },
                TargetMatch {
                    alert_name: "Neteng DC Link Down".to_string(),
                    label: "ZSideDeviceName".to_string(),
                },
            ],
            delay: Duration::from_secs(120),
            duration: Duration::from_secs(3600),
        }
    }

    fn config_with_rule() -> ConfigHandle {
        let mut config = Config::default();
        config
            .inhibit_rules
            .insert("Device down".to_string(), device_down_rule());
        ConfigHandle::from_config(config)
    }

    async fn seed_source(store: &MemStore) -> i64 {
        let mut tx = store.begin().await.unwrap();
        let source = mock_alert(0, "Neteng Device Down", "e1", Some("d1"), Severity::Info);
        let id = tx.insert_alert(&source).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn no_match_flushes_unchanged() {
        let store = Arc::new(MemStore::new());
        seed_source(&store).await;
        let stats = StatsRegistry::new();
        let inhibitor = Inhibitor::new(config_with_rule(), &stats);
        let token = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let mut link = mock_alert(0, "Neteng DC Link Down", "e2", Some("d2"), Severity::Info);
        link.labels = labels_of(&[("ZSideDeviceName", "d4")]);
        let mut tx = store.begin().await.unwrap();
        link.id = tx.insert_alert(&link).await.unwrap();
        tx.commit().await.unwrap();

        inhibitor.buffer("Device down", AlertEvent::new(link.clone(), EventType::Active));
        let store_dyn: Arc<dyn Store> = store.clone();
        inhibitor
            .check_rule(&token, &store_dyn, &out_tx, "Device down", &device_down_rule())
            .await;

        let flushed = out_rx.recv().await.unwrap();
        assert_eq!(flushed.alert.name, "Neteng DC Link Down");
        assert_eq!(flushed.alert.id, link.id);
        assert_eq!(store.alert(link.id).unwrap().status, Status::Active);
        assert_eq!(inhibitor.buffered("Device down"), 0);
    }

    #[tokio::test]
    async fn cross_referenced_targets_are_suppressed_and_dropped() {
        let store = Arc::new(MemStore::new());
        seed_source(&store).await;
        let stats = StatsRegistry::new();
        let inhibitor = Inhibitor::new(config_with_rule(), &stats);
        let token = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let mut tx = store.begin().await.unwrap();
        let mut bgp = mock_alert(0, "Neteng BGP Down", "e2", Some("d2"), Severity::Info);
        bgp.labels = labels_of(&[("RemoteDeviceName", "d1")]);
        bgp.id = tx.insert_alert(&bgp).await.unwrap();
        let mut link = mock_alert(0, "Neteng DC Link Down", "e3", Some("d2"), Severity::Warn);
        link.labels = labels_of(&[("ZSideDeviceName", "d1")]);
        link.id = tx.insert_alert(&link).await.unwrap();
        tx.commit().await.unwrap();

        inhibitor.buffer("Device down", AlertEvent::new(bgp.clone(), EventType::Active));
        inhibitor.buffer("Device down", AlertEvent::new(link.clone(), EventType::Active));
        let store_dyn: Arc<dyn Store> = store.clone();
        inhibitor
            .check_rule(&token, &store_dyn, &out_tx, "Device down", &device_down_rule())
            .await;

        assert_eq!(store.alert(bgp.id).unwrap().status, Status::Suppressed);
        assert_eq!(store.alert(link.id).unwrap().status, Status::Suppressed);
        assert_eq!(inhibitor.buffered("Device down"), 0);
        assert!(out_rx.try_recv().is_err());
        assert_eq!(stats.counter("inhibitor.alerts_inhibited").value(), 2);

        let history = store.records_for(bgp.id);
        assert_eq!(history.len(), 1);
        assert!(history[0].event.contains("inhibited"));
    }

    #[tokio::test]
    async fn routing_picks_rules_by_target_name() {
        let handle = config_with_rule();
        let config = handle.snapshot();
        assert_eq!(
            Inhibitor::route(&config, "Neteng BGP Down"),
            Some("Device down".to_string())
        );
        assert_eq!(Inhibitor::route(&config, "Neteng Device Down"), None);
    }
}
