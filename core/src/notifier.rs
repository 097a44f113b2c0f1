//! Fan-out of alert events to registered output channels.
//!
//! Events carry owned alert snapshots, so delivery needs no locking
//! against concurrent severity updates. Writes are non-blocking: a slow
//! output loses events (counted) rather than stalling the engine.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ConfigHandle;
use crate::models::AlertEvent;
use crate::stats::{Counter, StatsRegistry};

pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

pub struct Notifier {
    config: ConfigHandle,
    outputs: HashMap<String, mpsc::Sender<AlertEvent>>,
    dropped: Counter,
}

impl Notifier {
    pub fn new(config: ConfigHandle, stats: &StatsRegistry) -> Self {
        Notifier {
            config,
            outputs: HashMap::new(),
            dropped: stats.counter("notifier.dropped_events"),
        }
    }

    /// Register a named output and hand back its receiving end.
    /// Registration happens at assembly time, before the notifier is
    /// shared.
    pub fn register_output(&mut self, name: &str) -> mpsc::Receiver<AlertEvent> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        self.outputs.insert(name.to_string(), tx);
        rx
    }

    /// Deliver `event` to the outputs configured for its alert class,
    /// or to the default output when none are configured.
    pub fn notify(&self, event: AlertEvent) {
        let config = self.config.snapshot();
        let configured = config
            .alert_config(&event.alert.name)
            .map(|ac| ac.outputs.clone())
            .filter(|outputs| !outputs.is_empty());
        let targets = match configured {
            Some(outputs) => outputs,
            None => match &config.default_output {
                Some(name) => vec![name.clone()],
                None => {
                    debug!(
                        "no output configured for alert {}, dropping {} event",
                        event.alert.name, event.event_type
                    );
                    return;
                }
            },
        };
        for name in targets {
            let Some(tx) = self.outputs.get(&name) else {
                warn!("alert {} names unknown output {name}", event.alert.name);
                continue;
            };
            if tx.try_send(event.clone()).is_err() {
                self.dropped.add(1);
                warn!("output {name} full or closed, dropping {} event", event.event_type);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertConfig, Config};
    use crate::models::{Alert, EventType, Severity};
    use pretty_assertions::assert_eq;

    fn event(name: &str) -> AlertEvent {
        AlertEvent::new(Alert::new(name, "src", "e1", Severity::Info), EventType::Active)
    }

    fn config_with(name: &str, outputs: Vec<String>, default_output: Option<&str>) -> Config {
        let mut config = Config::default();
        config.alert_configs.insert(
            name.to_string(),
            AlertConfig { outputs, ..AlertConfig::default() },
        );
        config.default_output = default_output.map(str::to_string);
        config
    }

    #[tokio::test]
    async fn routes_to_configured_output() {
        let config = config_with("BGP Down", vec!["slack".to_string()], Some("pager"));
        let stats = StatsRegistry::new();
        let mut notifier = Notifier::new(ConfigHandle::from_config(config), &stats);
        let mut slack = notifier.register_output("slack");
        let mut pager = notifier.register_output("pager");

        notifier.notify(event("BGP Down"));
        let delivered = slack.recv().await.unwrap();
        assert_eq!(delivered.alert.name, "BGP Down");
        assert!(pager.try_recv().is_err());
    }

    #[tokio::test]
    async fn falls_back_to_default_output() {
        let config = config_with("BGP Down", vec![], Some("pager"));
        let stats = StatsRegistry::new();
        let mut notifier = Notifier::new(ConfigHandle::from_config(config), &stats);
        let mut pager = notifier.register_output("pager");

        notifier.notify(event("Unconfigured Alert"));
        assert_eq!(pager.recv().await.unwrap().alert.name, "Unconfigured Alert");
    }

    #[tokio::test]
    async fn overflow_drops_and_counts() {
        let config = config_with("X", vec!["slow".to_string()], None);
        let stats = StatsRegistry::new();
        let mut notifier = Notifier::new(ConfigHandle::from_config(config), &stats);
        let _rx = notifier.register_output("slow");

        for _ in 0..OUTPUT_CHANNEL_CAPACITY + 3 {
            notifier.notify(event("X"));
        }
        assert_eq!(stats.counter("notifier.dropped_events").value(), 3);
    }
}
