//! Aggregator stage: folds bursts of related alerts into one parent
//! aggregate alert.
//!
//! Matching alerts are grouped by a configured label value. When a
//! group reaches the rule threshold within a window, the stage inserts
//! (or reuses) an aggregate alert, links the children to it, and emits
//! the aggregate downstream instead of the individual alerts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{AggregationRule, Config, ConfigHandle};
use crate::models::{Alert, AlertEvent, EventType, Status};
use crate::pipeline::{send_or_cancelled, Processor, STAGE_CHANNEL_CAPACITY};
use crate::stats::{Counter, StatsRegistry};
use crate::store::{Store, StoreError};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(300);

pub const AGGREGATE_SOURCE: &str = "aggregator";

type Groups = HashMap<String, Vec<AlertEvent>>;

pub struct Aggregator {
    config: ConfigHandle,
    pending: Mutex<HashMap<String, Groups>>,
    aggregated: Counter,
    errors: Counter,
}

impl Aggregator {
    pub fn new(config: ConfigHandle, stats: &StatsRegistry) -> Self {
        Aggregator {
            config,
            pending: Mutex::new(HashMap::new()),
            aggregated: stats.counter("aggregator.alerts_aggregated"),
            errors: stats.counter("aggregator.errors"),
        }
    }

    /// Rule interested in this alert, provided the grouping label is
    /// present.
    fn route(config: &Config, alert: &Alert) -> Option<String> {
        let mut names: Vec<&String> = config.agg_rules.keys().collect();
        names.sort();
        names
            .into_iter()
            .find(|name| {
                let rule = &config.agg_rules[*name];
                rule.alert_name == alert.name && alert.labels.contains_key(&rule.group_by)
            })
            .cloned()
    }

    fn buffer(&self, rule_name: &str, rule: &AggregationRule, event: AlertEvent) {
        let group = event
            .alert
            .labels
            .get(&rule.group_by)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        debug!(
            "aggregator buffering alert {} under {rule_name}/{group}",
            event.alert.name
        );
        lock(&self.pending)
            .entry(rule_name.to_string())
            .or_default()
            .entry(group)
            .or_default()
            .push(event);
    }

    fn take_groups(&self, rule_name: &str) -> Groups {
        lock(&self.pending).remove(rule_name).unwrap_or_default()
    }

    pub(crate) fn buffered(&self, rule_name: &str) -> usize {
        lock(&self.pending)
            .get(rule_name)
            .map_or(0, |groups| groups.values().map(Vec::len).sum())
    }

    /// Check every group of `rule`: aggregate those at or above the
    /// threshold, flush the rest unchanged.
    async fn check_rule(
        &self,
        token: &CancellationToken,
        store: &Arc<dyn Store>,
        out: &mpsc::Sender<AlertEvent>,
        rule_name: &str,
        rule: &AggregationRule,
    ) {
        let mut groups: Vec<(String, Vec<AlertEvent>)> =
            self.take_groups(rule_name).into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        for (group, events) in groups {
            if events.len() < rule.threshold {
                for event in events {
                    if !send_or_cancelled(out, token, event).await {
                        return;
                    }
                }
                continue;
            }
            match self.aggregate_group(store, rule_name, rule, &group, &events).await {
                Ok(aggregate) => {
                    self.aggregated.add(events.len() as i64);
                    info!(
                        "aggregated {} alerts into {}:{}",
                        events.len(),
                        aggregate.name,
                        aggregate.id
                    );
                    if !send_or_cancelled(
                        out,
                        token,
                        AlertEvent::new(aggregate, EventType::Active),
                    )
                    .await
                    {
                        return;
                    }
                }
                Err(e) => {
                    error!("aggregation of {rule_name}/{group} failed: {e}");
                    self.errors.add(1);
                    for event in events {
                        if !send_or_cancelled(out, token, event).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Insert or reuse the group's aggregate alert and link the
    /// children to it.
    async fn aggregate_group(
        &self,
        store: &Arc<dyn Store>,
        rule_name: &str,
        rule: &AggregationRule,
        group: &str,
        events: &[AlertEvent],
    ) -> Result<Alert, StoreError> {
        let mut tx = store.begin().await?;
        let mut aggregate = match tx.get_alert_by_identity(rule_name, group, None).await? {
            Some(existing) if existing.is_aggregate => existing,
            _ => {
                let mut aggregate = Alert::new(rule_name, AGGREGATE_SOURCE, group, severity_of(events));
                aggregate.is_aggregate = true;
                aggregate.auto_clear = true;
                aggregate.team = events[0].alert.team.clone();
                aggregate.start_time = events
                    .iter()
                    .map(|e| e.alert.start_time)
                    .min()
                    .unwrap_or_else(Utc::now);
                aggregate.labels.insert(
                    rule.group_by.clone(),
                    serde_json::Value::String(group.to_string()),
                );
                aggregate.id = tx.insert_alert(&aggregate).await?;
                tx.insert_record(
                    aggregate.id,
                    &format!("Aggregate created for {} alerts", events.len()),
                )
                .await?;
                aggregate
            }
        };
        aggregate.last_active = Utc::now();
        if aggregate.severity > severity_of(events) {
            aggregate.severity = severity_of(events);
        }
        tx.update_alert(&aggregate).await?;
        for event in events {
            let mut child = event.alert.clone();
            if child.status == Status::Active {
                child.agg_id = aggregate.id;
                tx.update_alert(&child).await?;
                tx.insert_record(
                    child.id,
                    &format!("Alert aggregated into alert {}", aggregate.id),
                )
                .await?;
            }
        }
        tx.commit().await?;
        Ok(aggregate)
    }
}

/// Strongest severity among the children.
fn severity_of(events: &[AlertEvent]) -> crate::models::Severity {
    events
        .iter()
        .map(|e| e.alert.severity)
        .min()
        .unwrap_or(crate::models::Severity::Info)
}

fn lock(
    pending: &Mutex<HashMap<String, Groups>>,
) -> std::sync::MutexGuard<'_, HashMap<String, Groups>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Processor for Aggregator {
    fn name(&self) -> &str {
        "aggregator"
    }

    fn stage(&self) -> usize {
        2
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
            .agg_rules
            .values()
            .map(|r| r.window)
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
                        match Aggregator::route(&config, &event.alert) {
                            Some(rule_name) if event.event_type == EventType::Active => {
                                self.buffer(&rule_name, &config.agg_rules[&rule_name], event);
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
                        let mut names: Vec<&String> = config.agg_rules.keys().collect();
                        names.sort();
                        for name in names {
                            self.check_rule(&token, &store, &tx, name, &config.agg_rules[name])
                                .await;
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            // flush pending children on shutdown
            let config = self.config.snapshot();
            let mut names: Vec<&String> = config.agg_rules.keys().collect();
            names.sort();
            for name in names {
                for (_, events) in self.take_groups(name) {
                    for event in events {
                        if !send_or_cancelled(&tx, &token, event).await {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}
