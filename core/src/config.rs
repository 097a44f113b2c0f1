//! Declarative configuration: alert definitions, escalation and inhibit
//! rules, tunables. Loaded from a TOML file at startup and reloaded on
//! SIGHUP; readers take an `Arc` snapshot so in-flight events keep the
//! config they started with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::models::{Labels, MatchCondition, Severity, SuppressionRule};

pub const DEFAULT_TEAM: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub alert_configs: HashMap<String, AlertConfig>,
    #[serde(default)]
    pub inhibit_rules: HashMap<String, InhibitRule>,
    #[serde(default)]
    pub agg_rules: HashMap<String, AggregationRule>,
    #[serde(default)]
    pub suppression_rules: Vec<SeedSuppressionRule>,
    #[serde(default)]
    pub outputs: HashMap<String, OutputConfig>,
    #[serde(default)]
    pub default_output: Option<String>,
}

impl Config {
    pub fn alert_config(&self, name: &str) -> Option<&AlertConfig> {
        self.alert_configs.get(name)
    }

    /// Suppression rules to seed the suppressor with at startup.
    pub fn seed_rules(&self) -> Vec<SuppressionRule> {
        self.suppression_rules.iter().map(|s| s.to_rule()).collect()
    }

    fn normalize(&mut self) {
        if self.agent.team_name.is_empty() {
            self.agent.team_name = DEFAULT_TEAM.to_string();
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub team_name: String,
    #[serde(
        default = "default_stats_interval",
        deserialize_with = "duration_str::deserialize"
    )]
    pub stats_export_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            team_name: String::new(),
            stats_export_interval: default_stats_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_addr")]
    pub addr: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(
        default = "default_db_timeout",
        deserialize_with = "duration_str::deserialize"
    )]
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            addr: default_db_addr(),
            username: String::new(),
            password: String::new(),
            db_name: default_db_name(),
            timeout: default_db_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Quiet period before a CLEARED event commits; a fresh ACTIVE
    /// event within the window cancels the clear.
    #[serde(
        default = "default_clear_holddown",
        deserialize_with = "duration_str::deserialize"
    )]
    pub clear_holddown_interval: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            clear_holddown_interval: default_clear_holddown(),
        }
    }
}

/// Per-alert-class definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub auto_clear: bool,
    #[serde(default, deserialize_with = "duration_str::deserialize_opt")]
    pub auto_expire: Option<Duration>,
    #[serde(default)]
    pub escalation_rules: Vec<EscalationRule>,
}

/// Escalate un-owned alerts to `escalate_to` once `after` has elapsed
/// since the alert started. Rules are walked in declared order; the
/// first match wins.
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationRule {
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub after: Duration,
    pub escalate_to: Severity,
}

/// Automatic silencing of downstream alerts while a designated upstream
/// alert is active. Consumed by the inhibitor pipeline stage.
#[derive(Debug, Clone, Deserialize)]
pub struct InhibitRule {
    pub source_match: SourceMatch,
    pub target_matches: Vec<TargetMatch>,
    /// How long targets are buffered before the cross-reference check.
    #[serde(
        default = "default_inhibit_delay",
        deserialize_with = "duration_str::deserialize"
    )]
    pub delay: Duration,
    /// How long an inhibited target stays suppressed.
    #[serde(
        default = "default_inhibit_duration",
        deserialize_with = "duration_str::deserialize"
    )]
    pub duration: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceMatch {
    pub alert_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetMatch {
    pub alert_name: String,
    /// Label on the target whose value cross-references the source's
    /// device.
    pub label: String,
}

/// Group matching alerts by a label value; once a group reaches
/// `threshold` within the window, a parent aggregate alert replaces the
/// individual notifications. Consumed by the aggregator pipeline stage.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationRule {
    pub alert_name: String,
    pub group_by: String,
    #[serde(
        default = "default_agg_window",
        deserialize_with = "duration_str::deserialize"
    )]
    pub window: Duration,
    #[serde(default = "default_agg_threshold")]
    pub threshold: usize,
}

/// Suppression rule seeded from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedSuppressionRule {
    pub name: String,
    pub entities: Labels,
    #[serde(default = "default_match_condition")]
    pub match_condition: MatchCondition,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_creator")]
    pub creator: String,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub duration: Duration,
}

impl SeedSuppressionRule {
    pub fn to_rule(&self) -> SuppressionRule {
        SuppressionRule::new(
            self.name.clone(),
            self.entities.clone(),
            self.match_condition,
            self.reason.clone(),
            self.creator.clone(),
            self.duration,
        )
    }
}

/// Downstream receiver definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    Webhook { url: String },
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_db_addr() -> String {
    "127.0.0.1:5432".to_string()
}

fn default_db_name() -> String {
    "alerts".to_string()
}

fn default_db_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_clear_holddown() -> Duration {
    Duration::from_secs(60)
}

fn default_inhibit_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_inhibit_duration() -> Duration {
    Duration::from_secs(3600)
}

fn default_agg_window() -> Duration {
    Duration::from_secs(300)
}

fn default_agg_threshold() -> usize {
    2
}

fn default_match_condition() -> MatchCondition {
    MatchCondition::All
}

fn default_creator() -> String {
    "config".to_string()
}

struct ConfigInner {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

/// Shared handle to the live configuration. `snapshot` is cheap; the
/// pointer is swapped wholesale on reload.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ConfigInner>,
}

impl ConfigHandle {
    /// Read and parse the config file. Startup fails on any error here.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = read_config(&path)?;
        Ok(ConfigHandle {
            inner: Arc::new(ConfigInner {
                path: Some(path),
                current: RwLock::new(Arc::new(config)),
            }),
        })
    }

    /// Handle backed by an in-memory config, not reloadable from disk.
    pub fn from_config(mut config: Config) -> Self {
        config.normalize();
        ConfigHandle {
            inner: Arc::new(ConfigInner {
                path: None,
                current: RwLock::new(Arc::new(config)),
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read the config file. On failure the previous snapshot stays
    /// in place.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = self.inner.path.as_ref() else {
            return Ok(());
        };
        let config = read_config(path)?;
        let mut current = self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Arc::new(config);
        info!("alert config reloaded from {}", path.display());
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&raw)?;
    config.normalize();
    Ok(config)
}

/// Compact duration strings: `"90s"`, `"5m"`, `"1h30m"`, `"500ms"`.
pub mod duration_str {
    use std::time::Duration;

    use serde::de::{Deserialize, Deserializer, Error};

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }
        let mut total = Duration::ZERO;
        let mut digits = String::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let value: u64 = digits
                .parse()
                .map_err(|_| format!("invalid duration: {s}"))?;
            digits.clear();
            let unit = match c {
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    Duration::from_millis(1)
                }
                's' => Duration::from_secs(1),
                'm' => Duration::from_secs(60),
                'h' => Duration::from_secs(3600),
                'd' => Duration::from_secs(86400),
                other => return Err(format!("unknown duration unit: {other}")),
            };
            total += unit * value as u32;
        }
        if !digits.is_empty() {
            return Err(format!("missing unit in duration: {s}"));
        }
        Ok(total)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| parse(&s).map_err(D::Error::custom)).transpose()
    }
}
