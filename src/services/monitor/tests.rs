//! Tests for the Monitor module

use super::*;
use crate::domain::alert::{AlertId, AlertType};
use crate::domain::types::{
    CalibrationPoint, Device, DeviceStatus, EstimateMethod, ExitReason, Measurement, Outline,
    Point, PointTag, Snapshot,
};
use std::time::Duration;
use tempfile::TempDir;

const B1: &str = "C3:00:00:00:00:01";
const B2: &str = "C3:00:00:00:00:02";
const B3: &str = "C3:00:00:00:00:03";
const DOOR: &str = "C3:00:00:00:00:09";

/// Test harness that keeps the alert history directory alive
struct TestMonitor {
    monitor: Monitor,
    dir: TempDir,
}

impl std::ops::Deref for TestMonitor {
    type Target = Monitor;
    fn deref(&self) -> &Self::Target {
        &self.monitor
    }
}

impl std::ops::DerefMut for TestMonitor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.monitor
    }
}

impl TestMonitor {
    fn history(&self) -> Vec<serde_json::Value> {
        let content =
            std::fs::read_to_string(self.dir.path().join("alerts.jsonl")).unwrap_or_default();
        content.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }
}

fn snapshot(pairs: &[(&str, f64)]) -> Snapshot {
    pairs.iter().map(|(a, r)| (BeaconAddress::new(a), *r)).collect()
}

fn point(id: &str, x: f64, y: f64, readings: &[(&str, f64)]) -> CalibrationPoint {
    CalibrationPoint::new(id, id, Point::new(x, y)).with_measurement(Measurement {
        device_id: "calib".to_string(),
        timestamp: Utc::now(),
        readings: snapshot(readings),
    })
}

fn test_document(with_door_beacon: bool) -> StoreDocument {
    let mut room = RoomProfile::new("room1", "Living room");
    room.beacon_ids = vec!["b1".to_string(), "b2".to_string(), "b3".to_string()];
    room.outline = Some(Outline { width: 4.0, height: 4.0 });
    room.calibration_points = vec![
        point("p1", 0.25, 0.25, &[(B1, -50.0), (B2, -70.0), (B3, -70.0)]),
        point("p2", 0.75, 0.25, &[(B1, -70.0), (B2, -50.0), (B3, -70.0)]),
        CalibrationPoint::new("d_in", "door inside", Point::new(0.5, 1.0))
            .with_tag(PointTag::DoorInside),
        CalibrationPoint::new("d_out", "door outside", Point::new(0.5, 1.2))
            .with_tag(PointTag::DoorOutside),
    ];
    if with_door_beacon {
        room.door_beacon_ids = vec!["door".to_string()];
    }

    StoreDocument {
        beacons: vec![
            Beacon::new("b1", B1).with_position(0.0, 0.0),
            Beacon::new("b2", B2).with_position(4.0, 0.0),
            Beacon::new("b3", B3).with_position(0.0, 4.0),
            Beacon::new("door", DOOR),
        ],
        rooms: vec![room],
        devices: vec![Device {
            id: "dev1".to_string(),
            hardware_id: "2cf7f1c0530001a2".to_string(),
            name: "Rex".to_string(),
            status: DeviceStatus::Active,
        }],
    }
}

fn create_test_monitor(with_door_beacon: bool) -> TestMonitor {
    let dir = tempfile::tempdir().unwrap();
    let egress_file = dir.path().join("alerts.jsonl");
    let config = Config::default()
        .with_assignment("dev1", "room1")
        .with_egress_file(egress_file.to_str().unwrap());
    let monitor = Monitor::new(config, test_document(with_door_beacon), Arc::new(Metrics::new()), None);
    TestMonitor { monitor, dir }
}

fn at_p1() -> FeedRecord {
    FeedRecord::new("dev1", Utc::now()).with_reading(B1, -50).with_reading(B2, -70).with_reading(B3, -70)
}

fn door_weak() -> FeedRecord {
    at_p1().with_reading(DOOR, -90)
}

fn door_strong() -> FeedRecord {
    at_p1().with_reading(DOOR, -55)
}

fn exit_alert_id() -> AlertId {
    AlertId::for_condition("dev1", AlertType::ZoneExit)
}

#[test]
fn test_inside_from_fingerprint() {
    let mut monitor = create_test_monitor(false);

    let decision = monitor.process_record(at_p1(), Instant::now()).unwrap();

    assert!(decision.is_inside);
    assert_eq!(decision.reason, ExitReason::WithinOutline);
    let tracked = monitor.position("dev1").unwrap();
    let estimate = tracked.estimate.unwrap();
    assert_eq!(estimate.method, EstimateMethod::Fingerprint);
    assert_eq!(estimate.position, Point::new(0.25, 0.25));
    assert_eq!(monitor.alerts().active_count(), 0);
    assert_eq!(monitor.metrics.estimates_total(EstimateMethod::Fingerprint), 1);
}

#[test]
fn test_weak_door_signal_forces_exit() {
    let mut monitor = create_test_monitor(true);

    let decision = monitor.process_record(door_weak(), Instant::now()).unwrap();

    assert!(!decision.is_inside);
    assert_eq!(decision.reason, ExitReason::DoorSignalWeak);
    // Door midpoint (2.0, 4.4) m; slot 0 sits 1.5 m out and 1.0 m to the side
    let display = decision.display_position.unwrap();
    assert!((display.x - 0.75).abs() < 1e-9);
    assert!((display.y - 1.475).abs() < 1e-9);

    assert_eq!(monitor.exited("room1"), ["dev1".to_string()]);
    assert!(monitor.alerts().is_active(&exit_alert_id()));
    let alert = monitor.alerts().get(&exit_alert_id()).unwrap();
    assert_eq!(alert.message, "Rex left Living room");
    assert_eq!(monitor.metrics.exits_total(), 1);
    assert_eq!(monitor.metrics.exited_devices(), 1);
}

#[test]
fn test_repeated_exit_raises_once() {
    let mut monitor = create_test_monitor(true);
    let now = Instant::now();

    monitor.process_record(door_weak(), now);
    monitor.process_record(door_weak(), now + Duration::from_secs(1));

    assert_eq!(monitor.metrics.exits_total(), 1);
    assert_eq!(monitor.metrics.alerts_raised_total(), 1);
    assert_eq!(monitor.exited("room1").len(), 1);
}

#[test]
fn test_reentry_dismisses_exit_alert() {
    let mut monitor = create_test_monitor(true);
    let now = Instant::now();

    monitor.process_record(door_weak(), now);
    let decision = monitor.process_record(door_strong(), now + Duration::from_secs(1)).unwrap();

    assert!(decision.is_inside);
    assert!(monitor.exited("room1").is_empty());
    assert!(!monitor.alerts().is_active(&exit_alert_id()));
    assert_eq!(monitor.metrics.reentries_total(), 1);
    assert_eq!(monitor.metrics.alerts_dismissed_total(), 1);

    // Dismissal cancelled the pending auto-dismiss
    monitor.tick(now + Duration::from_secs(10));
    assert_eq!(monitor.metrics.alerts_expired_total(), 0);
}

#[test]
fn test_exit_alert_auto_dismisses() {
    let mut monitor = create_test_monitor(true);
    let now = Instant::now();

    monitor.process_record(door_weak(), now);

    monitor.tick(now + Duration::from_millis(4_999));
    assert!(monitor.alerts().is_active(&exit_alert_id()));

    monitor.tick(now + Duration::from_secs(5));
    assert!(!monitor.alerts().is_active(&exit_alert_id()));
    assert_eq!(monitor.metrics.alerts_expired_total(), 1);
    assert_eq!(monitor.metrics.active_alerts(), 0);
    // The device is still outside; only the alert went away
    assert_eq!(monitor.exited("room1").len(), 1);
}

#[test]
fn test_alert_history_written() {
    let mut monitor = create_test_monitor(true);
    let now = Instant::now();

    monitor.process_record(door_weak(), now);
    monitor.tick(now + Duration::from_secs(5));

    let history = monitor.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["t"], "raised");
    assert_eq!(history[1]["t"], "expired");
    assert_eq!(history[1]["alert"]["dismissed"], true);
}

#[test]
fn test_shock_and_sos_alerts() {
    let mut monitor = create_test_monitor(false);
    let mut record = at_p1();
    record.events = DeviceEvents::from_status(0x48);
    record.battery_pct = Some(80);

    monitor.process_record(record, Instant::now());

    assert!(monitor.alerts().is_active(&AlertId::for_condition("dev1", AlertType::Shock)));
    assert!(monitor.alerts().is_active(&AlertId::for_condition("dev1", AlertType::Sos)));

    let state = monitor.device_state("dev1").unwrap();
    assert!(state.motion);
    assert_eq!(state.last_event, Some("shock"));
    assert_eq!(state.battery_pct, Some(80));
}

#[test]
fn test_unassigned_device_only_updates_status() {
    let mut monitor = create_test_monitor(false);
    let record = FeedRecord::new("stranger", Utc::now()).with_reading(B1, -50);

    assert!(monitor.process_record(record, Instant::now()).is_none());
    assert!(monitor.position("stranger").is_none());
    assert!(monitor.device_state("stranger").is_some());
    assert_eq!(monitor.metrics.cycles_skipped_total(), 0);
}

#[test]
fn test_no_evidence_skips_cycle() {
    let mut monitor = create_test_monitor(false);
    let record = FeedRecord::new("dev1", Utc::now())
        .with_reading("AA:BB:CC:DD:EE:FF", -60)
        .with_reading("FF:FF:FF:FF:FF:FF", -1);

    assert!(monitor.process_record(record, Instant::now()).is_none());
    assert_eq!(monitor.metrics.cycles_skipped_total(), 1);
    assert_eq!(monitor.metrics.readings_dropped_total(), 1);
    assert!(monitor.position("dev1").is_none());
}

#[test]
fn test_trilateration_fallback_without_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = test_document(false);
    doc.rooms[0].calibration_points.clear();
    let config = Config::default()
        .with_assignment("dev1", "room1")
        .with_egress_file(dir.path().join("alerts.jsonl").to_str().unwrap());
    let mut monitor = Monitor::new(config, doc.clone(), Arc::new(Metrics::new()), None);

    monitor.process_record(at_p1(), Instant::now());
    let estimate = monitor.position("dev1").and_then(|p| p.estimate).unwrap();
    assert_eq!(estimate.method, EstimateMethod::Trilateration);

    let config = Config::default()
        .with_assignment("dev1", "room1")
        .with_egress_file(dir.path().join("alerts.jsonl").to_str().unwrap())
        .with_trilateration_fallback(false);
    let mut monitor = Monitor::new(config, doc, Arc::new(Metrics::new()), None);
    monitor.process_record(at_p1(), Instant::now());
    assert!(monitor.position("dev1").is_none());
}

#[test]
fn test_reload_keeps_roster() {
    let mut monitor = create_test_monitor(true);
    monitor.process_record(door_weak(), Instant::now());

    monitor.reload(test_document(true));

    assert_eq!(monitor.exited("room1"), ["dev1".to_string()]);
}

#[test]
fn test_position_egress() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default()
        .with_assignment("dev1", "room1")
        .with_egress_file(dir.path().join("alerts.jsonl").to_str().unwrap());
    let (sender, mut rx) = crate::io::egress_channel::create_egress_channel(16, "home".to_string());
    let mut monitor =
        Monitor::new(config, test_document(true), Arc::new(Metrics::new()), Some(sender));

    monitor.process_record(door_weak(), Instant::now());

    use crate::io::egress_channel::EgressMessage;
    let mut kinds = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        kinds.push(match msg {
            EgressMessage::Status(_) => "status",
            EgressMessage::Position(p) => {
                assert!(!p.inside);
                assert_eq!(p.reason, "door_signal_weak");
                "position"
            }
            EgressMessage::Alert(a) => {
                assert_eq!(a.t, "raised");
                "alert"
            }
            EgressMessage::Metrics(_) => "metrics",
        });
    }
    assert_eq!(kinds, ["status", "position", "alert"]);
}

#[tokio::test(start_paused = true)]
async fn test_run_consumes_hub_and_releases_subscriptions() {
    let mut monitor = create_test_monitor(true);
    let hub = FeedHub::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher = {
        let hub = hub.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(hub.listener_count("dev1"), 1);
            hub.publish(door_weak());
            tokio::time::sleep(Duration::from_secs(6)).await;
            let _ = shutdown_tx.send(true);
        }
    };

    tokio::join!(monitor.run(&hub, shutdown_rx), publisher);

    assert_eq!(monitor.exited("room1").len(), 1);
    // Raised, then expired by the tick loop
    assert_eq!(monitor.metrics.alerts_raised_total(), 1);
    assert_eq!(monitor.metrics.alerts_expired_total(), 1);
    assert_eq!(hub.listener_count("dev1"), 0);
}

#[tokio::test]
async fn test_refresh_from_store_applies_calibration_edits() {
    use crate::io::store::MemoryStore;

    let store = Arc::new(MemoryStore::new(test_document(false)));
    let TestMonitor { monitor, dir } = create_test_monitor(false);
    let mut monitor = TestMonitor { monitor: monitor.with_store(store.clone()), dir };

    // Without a door beacon the door reading is ignored
    assert!(monitor.process_record(door_weak(), Instant::now()).unwrap().is_inside);
    assert!(!monitor.refresh_from_store().await);

    let mut room = store.snapshot().room("room1").unwrap().clone();
    room.door_beacon_ids = vec!["door".to_string()];
    store.save_room(&room).await.unwrap();

    assert!(monitor.refresh_from_store().await);
    let decision = monitor.process_record(door_weak(), Instant::now()).unwrap();
    assert!(!decision.is_inside);
    assert_eq!(decision.reason, ExitReason::DoorSignalWeak);
}

#[tokio::test(start_paused = true)]
async fn test_run_reloads_store_periodically() {
    use crate::io::store::MemoryStore;

    let dir = tempfile::tempdir().unwrap();
    let config = Config::default()
        .with_assignment("dev1", "room1")
        .with_egress_file(dir.path().join("alerts.jsonl").to_str().unwrap())
        .with_store_reload_secs(1);
    let store = Arc::new(MemoryStore::new(test_document(false)));
    let mut monitor = Monitor::new(config, test_document(false), Arc::new(Metrics::new()), None)
        .with_store(store.clone());
    let hub = FeedHub::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let editor = {
        let hub = hub.clone();
        async move {
            let mut room = store.snapshot().room("room1").unwrap().clone();
            room.door_beacon_ids = vec!["door".to_string()];
            store.save_room(&room).await.unwrap();

            tokio::time::sleep(Duration::from_millis(1_500)).await;
            hub.publish(door_weak());
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = shutdown_tx.send(true);
        }
    };

    tokio::join!(monitor.run(&hub, shutdown_rx), editor);

    assert_eq!(monitor.doc.room("room1").unwrap().door_beacon_ids, vec!["door".to_string()]);
    assert_eq!(monitor.exited("room1").to_vec(), vec!["dev1".to_string()]);
}
