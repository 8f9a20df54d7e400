//! User-facing alerts raised from exit decisions and device events

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Condition that raised an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ZoneExit,
    Shock,
    Sos,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ZoneExit => "zone_exit",
            AlertType::Shock => "shock",
            AlertType::Sos => "sos",
        }
    }
}

/// Alert identity, derived from device and condition so re-raising dedups
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AlertId(String);

impl AlertId {
    pub fn for_condition(device_id: &str, alert_type: AlertType) -> Self {
        Self(format!("{}:{}", alert_type.as_str(), device_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: AlertId,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub message: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub dismissed: bool,
}

impl Alert {
    pub fn new(device_id: &str, alert_type: AlertType, message: &str) -> Self {
        Self {
            id: AlertId::for_condition(device_id, alert_type),
            alert_type,
            message: message.to_string(),
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            dismissed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_id_is_deterministic() {
        let a = AlertId::for_condition("dev1", AlertType::ZoneExit);
        let b = AlertId::for_condition("dev1", AlertType::ZoneExit);
        let c = AlertId::for_condition("dev1", AlertType::Shock);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "zone_exit:dev1");
    }
}
