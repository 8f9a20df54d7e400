//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send events to the MQTT publisher.
//! Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::alert::Alert;
use crate::domain::types::{epoch_ms, ExitDecision, FeedRecord, PositionEstimate};
use crate::infra::metrics::{MetricsSummary, METRICS_NUM_BUCKETS};
use crate::services::alerts::AlertChange;
use serde::Serialize;
use tokio::sync::mpsc;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Alert raised, dismissed or expired
    Alert(AlertPayload),
    /// Position estimate and exit decision for one feed record
    Position(PositionPayload),
    /// Device status from decoded telemetry
    Status(StatusPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// Payload for alert changes
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Change type: raised, dismissed, expired
    pub t: String,
    pub alert: Alert,
}

impl AlertPayload {
    pub fn from_change(change: &AlertChange) -> Self {
        Self { site: None, ts: epoch_ms(), t: change.as_str().to_string(), alert: change.alert().clone() }
    }
}

/// Payload for live positions
#[derive(Debug, Clone, Serialize)]
pub struct PositionPayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub device: String,
    pub room: String,
    /// Estimated position, absent when only a signal override decided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<PositionEstimate>,
    pub inside: bool,
    pub reason: String,
    /// Normalized display position when forced outside
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_y: Option<f64>,
}

impl PositionPayload {
    pub fn new(
        device: &str,
        room: &str,
        estimate: Option<&PositionEstimate>,
        decision: &ExitDecision,
    ) -> Self {
        Self {
            site: None,
            ts: epoch_ms(),
            device: device.to_string(),
            room: room.to_string(),
            estimate: estimate.cloned(),
            inside: decision.is_inside,
            reason: decision.reason.as_str().to_string(),
            display_x: decision.display_position.map(|p| p.x),
            display_y: decision.display_position.map(|p| p.y),
        }
    }
}

/// Payload for device status updates
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub device: String,
    /// Device-side sample time (RFC 3339)
    pub sampled_at: String,
    pub motion: bool,
    pub shock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_pct: Option<u16>,
}

impl StatusPayload {
    pub fn from_record(record: &FeedRecord) -> Self {
        Self {
            site: None,
            ts: epoch_ms(),
            device: record.device_id.clone(),
            sampled_at: record.timestamp.to_rfc3339(),
            motion: record.events.motion_detected(),
            shock: record.events.shock,
            last_event: record.events.primary().map(str::to_string),
            battery_pct: record.battery_pct,
            temperature_c: record.temperature_c,
            light_pct: record.light_pct,
        }
    }
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    /// Site identifier
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub feed_records_total: u64,
    pub records_per_sec: f64,
    pub readings_dropped_total: u64,
    pub estimates_fingerprint: u64,
    pub estimates_trilateration: u64,
    pub cycles_skipped: u64,
    /// Estimation latency histogram buckets (Prometheus-style exponential)
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub exits_total: u64,
    pub reentries_total: u64,
    pub alerts_raised: u64,
    pub active_alerts: u64,
    pub exited_devices: u64,
    /// Current feed queue depth (snapshot)
    pub feed_queue_depth: u64,
}

impl MetricsPayload {
    /// Create a metrics payload from a summary with site info
    pub fn from_summary(summary: MetricsSummary, site: String) -> Self {
        Self {
            site,
            ts: epoch_ms(),
            feed_records_total: summary.feed_records_total,
            records_per_sec: summary.records_per_sec,
            readings_dropped_total: summary.readings_dropped_total,
            estimates_fingerprint: summary.estimates_fingerprint_total,
            estimates_trilateration: summary.estimates_trilateration_total,
            cycles_skipped: summary.cycles_skipped_total,
            lat_buckets: summary.lat_buckets,
            lat_p50_us: summary.lat_p50_us,
            lat_p99_us: summary.lat_p99_us,
            exits_total: summary.exits_total,
            reentries_total: summary.reentries_total,
            alerts_raised: summary.alerts_raised_total,
            active_alerts: summary.active_alerts,
            exited_devices: summary.exited_devices,
            feed_queue_depth: summary.feed_queue_depth,
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
}

impl EgressSender {
    /// Create a new sender from an mpsc sender
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String) -> Self {
        Self { tx, site_id }
    }

    /// Send an alert change
    /// Injects site_id into the payload
    pub fn send_alert(&self, mut payload: AlertPayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Alert(payload));
    }

    /// Send a position update for live display
    /// Injects site_id into the payload
    pub fn send_position(&self, mut payload: PositionPayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Position(payload));
    }

    /// Send a device status update
    /// Injects site_id into the payload
    pub fn send_status(&self, mut payload: StatusPayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Status(payload));
    }

    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Metrics(payload));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alert::AlertType;
    use crate::domain::types::{ExitReason, Point};

    #[test]
    fn test_sender_injects_site() {
        let (sender, mut rx) = create_egress_channel(4, "home".to_string());
        let alert = Alert::new("dev1", AlertType::ZoneExit, "Left the room");

        sender.send_alert(AlertPayload::from_change(&AlertChange::Raised(alert)));

        match rx.try_recv().unwrap() {
            EgressMessage::Alert(payload) => {
                assert_eq!(payload.site.as_deref(), Some("home"));
                assert_eq!(payload.t, "raised");
                let json = serde_json::to_value(&payload).unwrap();
                assert_eq!(json["alert"]["id"], "zone_exit:dev1");
                assert_eq!(json["alert"]["type"], "zone_exit");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_full_channel_drops() {
        let (sender, mut rx) = create_egress_channel(1, "home".to_string());
        let decision = ExitDecision {
            is_inside: false,
            display_position: Some(Point::new(0.5, 1.4)),
            reason: ExitReason::DoorSignalWeak,
        };

        sender.send_position(PositionPayload::new("dev1", "room1", None, &decision));
        sender.send_position(PositionPayload::new("dev1", "room1", None, &decision));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_position_payload_omits_empty_fields() {
        let decision =
            ExitDecision { is_inside: true, display_position: None, reason: ExitReason::WithinOutline };
        let json = serde_json::to_value(PositionPayload::new("dev1", "room1", None, &decision)).unwrap();

        assert_eq!(json["inside"], true);
        assert_eq!(json["reason"], "within_outline");
        assert!(json.get("display_x").is_none());
        assert!(json.get("estimate").is_none());
    }
}
