//! Process-wide counters and gauges, exported on a ticker.
//!
//! The registry replaces the usual global metric tables: it is built at
//! startup and handed to each component, which keeps cheap clonable
//! handles to the metrics it owns.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    pub fn add(&self, delta: i64) {
        if delta < 0 {
            warn!("cannot subtract from a counter");
            return;
        }
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Last-value gauge.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicI64>,
}

impl Gauge {
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Counter),
    Gauge(Gauge),
}

/// Named metric registry shared by all components.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    metrics: Mutex<BTreeMap<String, Metric>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        StatsRegistry::default()
    }

    /// Get or create the counter registered under `name`.
    pub fn counter(&self, name: &str) -> Counter {
        let mut metrics = lock(&self.metrics);
        match metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Counter(Counter::default()))
        {
            Metric::Counter(c) => c.clone(),
            Metric::Gauge(_) => {
                warn!("metric {name} already registered as a gauge");
                Counter::default()
            }
        }
    }

    /// Get or create the gauge registered under `name`.
    pub fn gauge(&self, name: &str) -> Gauge {
        let mut metrics = lock(&self.metrics);
        match metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Gauge(Gauge::default()))
        {
            Metric::Gauge(g) => g.clone(),
            Metric::Counter(_) => {
                warn!("metric {name} already registered as a counter");
                Gauge::default()
            }
        }
    }

    /// Current value of every registered metric, name-ordered.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        lock(&self.metrics)
            .iter()
            .map(|(name, metric)| {
                let value = match metric {
                    Metric::Counter(c) => c.value(),
                    Metric::Gauge(g) => g.value(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Emit one structured log line per metric every `interval` until the
/// token is cancelled. The external reporting pipeline consumes these
/// lines; the wire protocol is not our concern.
pub async fn run_exporter(
    registry: Arc<StatsRegistry>,
    interval: Duration,
    token: CancellationToken,
) {
    let period = if interval.is_zero() {
        Duration::from_secs(60)
    } else {
        interval
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (name, value) in registry.snapshot() {
                    info!(target: "alertmgr::stats", metric = %name, value);
                }
            }
            _ = token.cancelled() => return,
        }
    }
}
