//! Alert lifecycle: dedup, auto-dismiss, explicit dismissal
//!
//! Alert ids derive from (device, condition), so raising a condition that is
//! still active is a no-op. Each alert carries its own auto-dismiss deadline;
//! dismissing removes the entry and with it the pending deadline, so a stale
//! expiry can never clear a newer alert for the same condition.
//!
//! Expiry is driven by the owner's tick loop through `expire_due`.

use crate::domain::alert::{Alert, AlertId, AlertType};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default auto-dismiss delay (5 seconds)
pub const DEFAULT_AUTO_DISMISS: Duration = Duration::from_secs(5);

/// A change in the active alert set, drained by the owner for egress
#[derive(Debug, Clone, PartialEq)]
pub enum AlertChange {
    Raised(Alert),
    Dismissed(Alert),
    Expired(Alert),
}

impl AlertChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertChange::Raised(_) => "raised",
            AlertChange::Dismissed(_) => "dismissed",
            AlertChange::Expired(_) => "expired",
        }
    }

    pub fn alert(&self) -> &Alert {
        match self {
            AlertChange::Raised(a) | AlertChange::Dismissed(a) | AlertChange::Expired(a) => a,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveAlert {
    alert: Alert,
    expires_at: Instant,
}

/// Active alerts keyed by their deterministic id
pub struct AlertCenter {
    active: FxHashMap<AlertId, ActiveAlert>,
    auto_dismiss: Duration,
    /// Changes not yet drained by the owner
    changes: Vec<AlertChange>,
}

impl AlertCenter {
    pub fn new(auto_dismiss: Duration) -> Self {
        Self { active: FxHashMap::default(), auto_dismiss, changes: Vec::new() }
    }

    /// Raise a condition for a device
    ///
    /// Returns the alert id. If the same condition is already active nothing
    /// changes, including its pending auto-dismiss deadline.
    pub fn raise(
        &mut self,
        device_id: &str,
        alert_type: AlertType,
        message: &str,
        now: Instant,
    ) -> AlertId {
        let id = AlertId::for_condition(device_id, alert_type);
        if self.active.contains_key(&id) {
            debug!(alert_id = %id, "alert_already_active");
            return id;
        }

        let alert = Alert::new(device_id, alert_type, message);
        info!(
            alert_id = %id,
            device_id = %device_id,
            alert_type = %alert_type.as_str(),
            message = %message,
            "alert_raised"
        );

        self.changes.push(AlertChange::Raised(alert.clone()));
        self.active.insert(id.clone(), ActiveAlert { alert, expires_at: now + self.auto_dismiss });
        id
    }

    /// Dismiss an active alert, cancelling its auto-dismissal
    ///
    /// Returns the dismissed alert, or `None` if it was not active.
    pub fn dismiss(&mut self, id: &AlertId) -> Option<Alert> {
        let mut entry = self.active.remove(id)?;
        entry.alert.dismissed = true;
        info!(alert_id = %id, "alert_dismissed");
        self.changes.push(AlertChange::Dismissed(entry.alert.clone()));
        Some(entry.alert)
    }

    /// Remove every alert whose deadline has passed
    pub fn expire_due(&mut self, now: Instant) -> Vec<Alert> {
        let due: Vec<AlertId> = self
            .active
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            if let Some(mut entry) = self.active.remove(&id) {
                entry.alert.dismissed = true;
                debug!(alert_id = %id, "alert_expired");
                self.changes.push(AlertChange::Expired(entry.alert.clone()));
                expired.push(entry.alert);
            }
        }
        expired
    }

    pub fn is_active(&self, id: &AlertId) -> bool {
        self.active.contains_key(id)
    }

    pub fn get(&self, id: &AlertId) -> Option<&Alert> {
        self.active.get(id).map(|entry| &entry.alert)
    }

    /// Active alerts, oldest first
    pub fn active(&self) -> Vec<&Alert> {
        let mut alerts: Vec<&Alert> = self.active.values().map(|entry| &entry.alert).collect();
        alerts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Earliest pending auto-dismiss deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.values().map(|entry| entry.expires_at).min()
    }

    /// Take the changes recorded since the last call
    pub fn take_changes(&mut self) -> Vec<AlertChange> {
        std::mem::take(&mut self.changes)
    }
}

impl Default for AlertCenter {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_DISMISS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_creates_alert() {
        let mut center = AlertCenter::default();
        let now = Instant::now();

        let id = center.raise("dev1", AlertType::ZoneExit, "Left the room", now);

        assert!(center.is_active(&id));
        let alert = center.get(&id).unwrap();
        assert_eq!(alert.device_id, "dev1");
        assert_eq!(alert.alert_type, AlertType::ZoneExit);
        assert!(!alert.dismissed);
    }

    #[test]
    fn test_raise_twice_dedups() {
        let mut center = AlertCenter::default();
        let now = Instant::now();

        let first = center.raise("dev1", AlertType::ZoneExit, "Left the room", now);
        let second =
            center.raise("dev1", AlertType::ZoneExit, "Left the room", now + Duration::from_secs(1));

        assert_eq!(first, second);
        assert_eq!(center.active_count(), 1);
        let raised = center
            .take_changes()
            .into_iter()
            .filter(|c| matches!(c, AlertChange::Raised(_)))
            .count();
        assert_eq!(raised, 1);
    }

    #[test]
    fn test_distinct_conditions_coexist() {
        let mut center = AlertCenter::default();
        let now = Instant::now();

        center.raise("dev1", AlertType::ZoneExit, "Left the room", now);
        center.raise("dev1", AlertType::Shock, "Shock detected", now);
        center.raise("dev2", AlertType::ZoneExit, "Left the room", now);

        assert_eq!(center.active_count(), 3);
    }

    #[test]
    fn test_auto_dismiss_after_delay() {
        let mut center = AlertCenter::default();
        let now = Instant::now();
        let id = center.raise("dev1", AlertType::Shock, "Shock detected", now);

        assert!(center.expire_due(now + Duration::from_millis(4_999)).is_empty());
        assert!(center.is_active(&id));

        let expired = center.expire_due(now + DEFAULT_AUTO_DISMISS);
        assert_eq!(expired.len(), 1);
        assert!(expired[0].dismissed);
        assert!(!center.is_active(&id));
    }

    #[test]
    fn test_dismiss_cancels_auto_dismiss() {
        let mut center = AlertCenter::default();
        let t0 = Instant::now();
        let id = center.raise("dev1", AlertType::ZoneExit, "Left the room", t0);

        let dismissed = center.dismiss(&id).unwrap();
        assert!(dismissed.dismissed);

        // Re-raise later; the first deadline must not clear the new alert
        let t1 = t0 + Duration::from_secs(3);
        center.raise("dev1", AlertType::ZoneExit, "Left the room", t1);
        assert!(center.expire_due(t0 + DEFAULT_AUTO_DISMISS).is_empty());
        assert!(center.is_active(&id));

        assert_eq!(center.expire_due(t1 + DEFAULT_AUTO_DISMISS).len(), 1);
    }

    #[test]
    fn test_dismiss_inactive_is_noop() {
        let mut center = AlertCenter::default();
        let id = AlertId::for_condition("dev1", AlertType::Sos);

        assert!(center.dismiss(&id).is_none());
        assert!(center.take_changes().is_empty());
    }

    #[test]
    fn test_changes_drained_once() {
        let mut center = AlertCenter::default();
        let now = Instant::now();
        let id = center.raise("dev1", AlertType::ZoneExit, "Left the room", now);
        center.dismiss(&id);

        let changes = center.take_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].as_str(), "raised");
        assert_eq!(changes[1].as_str(), "dismissed");
        assert!(center.take_changes().is_empty());
    }

    #[test]
    fn test_next_deadline() {
        let mut center = AlertCenter::new(Duration::from_secs(2));
        let now = Instant::now();
        assert!(center.next_deadline().is_none());

        center.raise("dev1", AlertType::ZoneExit, "Left the room", now);
        center.raise("dev2", AlertType::ZoneExit, "Left the room", now + Duration::from_secs(1));

        assert_eq!(center.next_deadline(), Some(now + Duration::from_secs(2)));
    }
}
