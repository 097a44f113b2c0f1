//! Core data model: alerts, alert events, suppression rules, history.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Arbitrary JSON-representable metadata attached to an alert.
pub type Labels = HashMap<String, serde_json::Value>;

/// Alert severity. Numerically lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Severity {
    Critical = 1,
    Warn = 2,
    Info = 3,
}

impl Severity {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Severity::Critical),
            2 => Some(Severity::Warn),
            3 => Some(Severity::Info),
            _ => None,
        }
    }

    /// True if `self` outranks `other` (strictly more severe).
    pub fn is_more_severe_than(self, other: Severity) -> bool {
        self < other
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "CRITICAL",
            Severity::Warn => "WARN",
            Severity::Info => "INFO",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Severity::Critical),
            "WARN" => Ok(Severity::Warn),
            "INFO" => Ok(Severity::Info),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Severity> for String {
    fn from(sev: Severity) -> String {
        sev.to_string()
    }
}

/// Alert lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Status {
    Active = 1,
    Suppressed = 2,
    Expired = 3,
    Cleared = 4,
    Acked = 5,
}

impl Status {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Status::Active),
            2 => Some(Status::Suppressed),
            3 => Some(Status::Expired),
            4 => Some(Status::Cleared),
            5 => Some(Status::Acked),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transitions; a new occurrence
    /// of the same identity requires a fresh insert.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Expired | Status::Cleared)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Active => "ACTIVE",
            Status::Suppressed => "SUPPRESSED",
            Status::Expired => "EXPIRED",
            Status::Cleared => "CLEARED",
            Status::Acked => "ACKD",
        };
        f.write_str(s)
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Status::Active),
            "SUPPRESSED" => Ok(Status::Suppressed),
            "EXPIRED" => Ok(Status::Expired),
            "CLEARED" => Ok(Status::Cleared),
            "ACKD" => Ok(Status::Acked),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

impl TryFrom<String> for Status {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Status> for String {
    fn from(status: Status) -> String {
        status.to_string()
    }
}

/// Kind of an [`AlertEvent`]. `Active` and `Cleared` are inputs to the
/// engine; the rest are emitted by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventType {
    Active,
    Cleared,
    Suppressed,
    Expired,
    Escalated,
    Acked,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Active => "ACTIVE",
            EventType::Cleared => "CLEARED",
            EventType::Suppressed => "SUPPRESSED",
            EventType::Expired => "EXPIRED",
            EventType::Escalated => "ESCALATED",
            EventType::Acked => "ACKD",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(EventType::Active),
            "CLEARED" => Ok(EventType::Cleared),
            "SUPPRESSED" => Ok(EventType::Suppressed),
            "EXPIRED" => Ok(EventType::Expired),
            "ESCALATED" => Ok(EventType::Escalated),
            "ACKD" => Ok(EventType::Acked),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

impl TryFrom<String> for EventType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> String {
        t.to_string()
    }
}

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

fn default_status() -> Status {
    Status::Active
}

/// The primary entity. An alert is uniquely identified by its `id` once
/// assigned, or by `(name, entity, device)` when a device is present,
/// or `(name, entity)` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Assigned by the store on insert; 0 means not yet persisted.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub scope: String,
    pub entity: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub team: String,
    pub severity: Severity,
    #[serde(default = "default_status")]
    pub status: Status,
    #[serde(default = "default_now")]
    pub start_time: DateTime<Utc>,
    #[serde(default = "default_now")]
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub auto_clear_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub auto_clear: bool,
    /// Id of the parent aggregate alert, 0 when none.
    #[serde(default)]
    pub agg_id: i64,
    #[serde(default)]
    pub is_aggregate: bool,
}

impl Alert {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        entity: impl Into<String>,
        severity: Severity,
    ) -> Self {
        let now = Utc::now();
        Alert {
            id: 0,
            name: name.into(),
            source: source.into(),
            scope: String::new(),
            entity: entity.into(),
            device: None,
            owner: None,
            team: String::new(),
            severity,
            status: Status::Active,
            start_time: now,
            last_active: now,
            auto_clear_at: None,
            labels: Labels::new(),
            auto_clear: false,
            agg_id: 0,
            is_aggregate: false,
        }
    }

    /// Copy identity fields into `labels` without overwriting keys the
    /// listener already set. Suppression rules match on these labels.
    pub fn extend_labels(&mut self) {
        let mut extend = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                self.labels
                    .entry(key.to_string())
                    .or_insert_with(|| serde_json::Value::String(v));
            }
        };
        extend("alert_name", Some(self.name.clone()));
        extend("entity", Some(self.entity.clone()));
        extend("device", self.device.clone());
        extend("source", Some(self.source.clone()));
        if !self.scope.is_empty() {
            extend("scope", Some(self.scope.clone()));
        }
    }

    /// Suppress for `duration`: the expiry housekeeper picks the alert
    /// back up once `auto_clear_at` passes.
    pub fn suppress(&mut self, duration: Duration) {
        self.status = Status::Suppressed;
        self.auto_clear_at = Some(Utc::now() + to_chrono(duration));
    }

    pub fn clear(&mut self) {
        self.status = Status::Cleared;
    }

    pub fn set_owner(&mut self, owner: impl Into<String>, team: impl Into<String>) {
        self.owner = Some(owner.into());
        self.team = team.into();
        self.status = Status::Acked;
    }

    pub fn has_aggregate(&self) -> bool {
        self.agg_id != 0
    }
}

/// An alert plus what happened to it. Listeners construct `Active` and
/// `Cleared` events; the engine emits the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert: Alert,
    #[serde(rename = "type")]
    pub event_type: EventType,
}

impl AlertEvent {
    pub fn new(alert: Alert, event_type: EventType) -> Self {
        AlertEvent { alert, event_type }
    }
}

/// How a suppression rule's entity mapping is matched against labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MatchCondition {
    All,
    Any,
}

impl fmt::Display for MatchCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchCondition::All => "ALL",
            MatchCondition::Any => "ANY",
        })
    }
}

impl FromStr for MatchCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(MatchCondition::All),
            "ANY" => Ok(MatchCondition::Any),
            other => Err(format!("unknown match condition: {other}")),
        }
    }
}

impl TryFrom<String> for MatchCondition {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MatchCondition> for String {
    fn from(c: MatchCondition) -> String {
        c.to_string()
    }
}

/// Rule-based silencing: alerts whose labels match a live rule are
/// dropped before insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressionRule {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub entities: Labels,
    pub match_condition: MatchCondition,
    pub reason: String,
    pub creator: String,
    #[serde(default = "default_now")]
    pub created_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SuppressionRule {
    pub fn new(
        name: impl Into<String>,
        entities: Labels,
        match_condition: MatchCondition,
        reason: impl Into<String>,
        creator: impl Into<String>,
        duration: Duration,
    ) -> Self {
        SuppressionRule {
            id: 0,
            name: name.into(),
            entities,
            match_condition,
            reason: reason.into(),
            creator: creator.into(),
            created_at: Utc::now(),
            duration,
        }
    }

    /// Remaining lifetime, zero once expired.
    pub fn time_left(&self) -> Duration {
        let expires = self.created_at + to_chrono(self.duration);
        (expires - Utc::now()).to_std().unwrap_or_default()
    }

    pub fn is_live(&self) -> bool {
        !self.time_left().is_zero()
    }
}

/// Append-only audit record for an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub alert_id: i64,
    pub timestamp: DateTime<Utc>,
    pub event: String,
}

/// Seconds-precision conversion; the store persists seconds anyway.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs().min(i64::MAX as u64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical.is_more_severe_than(Severity::Warn));
        assert!(Severity::Warn.is_more_severe_than(Severity::Info));
        assert!(!Severity::Info.is_more_severe_than(Severity::Info));
        assert!(!Severity::Info.is_more_severe_than(Severity::Critical));
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warn);
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("fatal".parse::<Severity>().is_err());
    }

    #[test]
    fn status_terminality() {
        assert!(Status::Cleared.is_terminal());
        assert!(Status::Expired.is_terminal());
        assert!(!Status::Active.is_terminal());
        assert!(!Status::Acked.is_terminal());
    }

    #[test]
    fn extend_labels_does_not_overwrite() {
        let mut alert = Alert::new("BGP Down", "bgpmon", "r1", Severity::Info);
        alert.device = Some("d1".to_string());
        alert
            .labels
            .insert("entity".to_string(), serde_json::json!("custom"));
        alert.extend_labels();
        assert_eq!(alert.labels["alert_name"], serde_json::json!("BGP Down"));
        assert_eq!(alert.labels["device"], serde_json::json!("d1"));
        assert_eq!(alert.labels["entity"], serde_json::json!("custom"));
    }

    #[test]
    fn suppression_rule_liveness() {
        let rule = SuppressionRule::new(
            "r",
            Labels::new(),
            MatchCondition::All,
            "maintenance",
            "test",
            Duration::from_secs(600),
        );
        assert!(rule.is_live());
        let mut expired = rule.clone();
        expired.created_at = Utc::now() - chrono::Duration::seconds(601);
        assert!(!expired.is_live());
        assert_eq!(expired.time_left(), Duration::ZERO);
    }

    #[test]
    fn alert_event_wire_format() {
        let event: AlertEvent = serde_json::from_str(
            r#"{"alert":{"name":"BGP Down","source":"bgpmon","entity":"r1","severity":"INFO"},"type":"ACTIVE"}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, EventType::Active);
        assert_eq!(event.alert.status, Status::Active);
        assert!(event.alert.labels.is_empty());
        assert_eq!(event.alert.id, 0);
    }
}
