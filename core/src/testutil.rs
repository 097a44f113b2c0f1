//! Shared helpers for the test modules.

use crate::models::{Alert, Labels, Severity, Status};

pub(crate) fn mock_alert(
    id: i64,
    name: &str,
    entity: &str,
    device: Option<&str>,
    severity: Severity,
) -> Alert {
    let mut alert = Alert::new(name, "test-source", entity, severity);
    alert.id = id;
    alert.device = device.map(str::to_string);
    alert.team = "default".to_string();
    alert.status = Status::Active;
    alert.auto_clear = true;
    alert
}

pub(crate) fn labels_of(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
        .collect()
}
