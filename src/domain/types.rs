//! Shared types for zone tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Reference signal strength at 1 meter when a beacon does not declare one (dBm)
pub const DEFAULT_TX_POWER: f64 = -59.0;

/// RSSI value the tracker reports for an empty beacon slot
pub const RSSI_NO_DETECTION: i32 = -1;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Normalized beacon hardware address (uppercase hex, no separators)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BeaconAddress(String);

impl BeaconAddress {
    /// Normalize a raw address: uppercase, separators stripped
    pub fn new(raw: &str) -> Self {
        Self(
            raw.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All-F address, reported when no beacon filled the slot
    pub fn is_sentinel(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c == 'F')
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.is_sentinel()
    }
}

impl std::fmt::Display for BeaconAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BeaconAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(BeaconAddress::new(&raw))
    }
}

/// Signal strength per beacon address (dBm)
pub type Snapshot = BTreeMap<BeaconAddress, f64>;

/// 2-D coordinate, either normalized room space or meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Whether both coordinates lie in [0,1]
    pub fn is_normalized(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }
}

/// Real-world room dimensions in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub width: f64,
    pub height: f64,
}

/// Reference emitter registered in the beacon registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub id: String,
    pub address: BeaconAddress,
    /// RSSI at 1 m (dBm)
    #[serde(default = "default_tx_power")]
    pub tx_power: f64,
    /// Fixed coordinate in meters, needed for trilateration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_tx_power() -> f64 {
    DEFAULT_TX_POWER
}

impl Beacon {
    pub fn new(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: BeaconAddress::new(address),
            tx_power: DEFAULT_TX_POWER,
            position: None,
            tags: Vec::new(),
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Point::new(x, y));
        self
    }
}

/// One signal-strength sample from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub readings: Snapshot,
}

/// Role of a calibration point in door geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointTag {
    DoorInside,
    DoorOutside,
}

/// Labeled reference location with its recorded samples
///
/// `position` is normalized to the room outline. Values outside [0,1] mark
/// intentionally off-zone references (the outer door point) and are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub id: String,
    pub label: String,
    pub position: Point,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<PointTag>,
}

impl CalibrationPoint {
    pub fn new(id: &str, label: &str, position: Point) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            position,
            measurements: Vec::new(),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: PointTag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn with_measurement(mut self, measurement: Measurement) -> Self {
        self.measurements.push(measurement);
        self
    }

    /// Most recent measurement; on equal timestamps the later-appended one wins
    pub fn latest_measurement(&self) -> Option<&Measurement> {
        self.measurements.iter().reduce(|best, m| if m.timestamp >= best.timestamp { m } else { best })
    }
}

/// A calibrated zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomProfile {
    pub id: String,
    pub name: String,
    /// Beacon registry ids, conventionally three
    #[serde(default)]
    pub beacon_ids: Vec<String>,
    /// Absent means coordinates are unit-normalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<Outline>,
    #[serde(default)]
    pub calibration_points: Vec<CalibrationPoint>,
    #[serde(default)]
    pub door_beacon_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoomProfile {
    pub fn new(id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            beacon_ids: Vec::new(),
            outline: None,
            calibration_points: Vec::new(),
            door_beacon_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn calibration_point_mut(&mut self, point_id: &str) -> Option<&mut CalibrationPoint> {
        self.calibration_points.iter_mut().find(|p| p.id == point_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Tracked device status as reported by the device registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
}

/// A tracked unit. Read-only for the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    /// LoRaWAN DevEUI of the tracker
    pub hardware_id: String,
    pub name: String,
    #[serde(default)]
    pub status: DeviceStatus,
}

/// One `{address, rssi}` pair as reported by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub address: BeaconAddress,
    pub rssi: i32,
}

impl Reading {
    pub fn new(address: &str, rssi: i32) -> Self {
        Self { address: BeaconAddress::new(address), rssi }
    }

    /// False for empty slots (all-F address) and "no detection" RSSI
    pub fn is_valid(&self) -> bool {
        self.address.is_valid() && self.rssi != RSSI_NO_DETECTION
    }
}

/// Event flags carried in the low byte of the tracker's event status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceEvents {
    pub start_moving: bool,
    pub end_movement: bool,
    pub motionless: bool,
    pub shock: bool,
    pub temp_event: bool,
    pub light_event: bool,
    pub sos: bool,
    pub press_once: bool,
}

impl DeviceEvents {
    pub fn from_status(event_status: u32) -> Self {
        let eb = event_status & 0xFF;
        Self {
            start_moving: eb & 0x01 != 0,
            end_movement: eb & 0x02 != 0,
            motionless: eb & 0x04 != 0,
            shock: eb & 0x08 != 0,
            temp_event: eb & 0x10 != 0,
            light_event: eb & 0x20 != 0,
            sos: eb & 0x40 != 0,
            press_once: eb & 0x80 != 0,
        }
    }

    pub fn motion_detected(&self) -> bool {
        self.start_moving || self.shock
    }

    /// Representative event name, highest priority first
    pub fn primary(&self) -> Option<&'static str> {
        [
            (self.shock, "shock"),
            (self.start_moving, "start_moving"),
            (self.end_movement, "end_movement"),
            (self.motionless, "motionless"),
            (self.press_once, "press_once"),
            (self.sos, "sos"),
            (self.temp_event, "temp_event"),
            (self.light_event, "light_event"),
        ]
        .into_iter()
        .find(|(set, _)| *set)
        .map(|(_, name)| name)
    }
}

/// One record of a device's live telemetry feed
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    pub device_id: String,
    /// Device-side update timestamp; a change marks a new sample
    pub timestamp: DateTime<Utc>,
    pub readings: SmallVec<[Reading; 3]>,
    pub battery_pct: Option<u8>,
    pub temperature_c: Option<f64>,
    pub light_pct: Option<u16>,
    pub events: DeviceEvents,
}

impl FeedRecord {
    pub fn new(device_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp,
            readings: SmallVec::new(),
            battery_pct: None,
            temperature_c: None,
            light_pct: None,
            events: DeviceEvents::default(),
        }
    }

    pub fn with_reading(mut self, address: &str, rssi: i32) -> Self {
        self.readings.push(Reading::new(address, rssi));
        self
    }

    /// Valid readings only, keyed by normalized address
    pub fn snapshot(&self) -> Snapshot {
        self.readings
            .iter()
            .filter(|r| r.is_valid())
            .map(|r| (r.address.clone(), f64::from(r.rssi)))
            .collect()
    }

    pub fn to_measurement(&self) -> Measurement {
        Measurement {
            device_id: self.device_id.clone(),
            timestamp: self.timestamp,
            readings: self.snapshot(),
        }
    }
}

/// How a position estimate was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    Fingerprint,
    Trilateration,
}

impl EstimateMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimateMethod::Fingerprint => "fingerprint",
            EstimateMethod::Trilateration => "trilateration",
        }
    }
}

/// Coordinate space of an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordSpace {
    /// Room-relative [0,1] coordinates, as calibration points
    Normalized,
    /// Meters, as fixed beacon coordinates
    Meters,
}

/// Transient location estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionEstimate {
    pub position: Point,
    /// In [0,1]
    pub confidence: f64,
    pub method: EstimateMethod,
    pub space: CoordSpace,
}

/// Why a device was judged inside or outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    WithinOutline,
    OutsideOutline,
    /// Door beacon average below threshold
    DoorSignalWeak,
    /// Door beacons missing while other beacons are heard
    DoorBeaconLost,
    /// Fallback on the room's first beacons when no door beacon is configured
    RoomBeaconsWeak,
    /// Fallback beacons missing while other beacons are heard
    RoomBeaconsLost,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::WithinOutline => "within_outline",
            ExitReason::OutsideOutline => "outside_outline",
            ExitReason::DoorSignalWeak => "door_signal_weak",
            ExitReason::DoorBeaconLost => "door_beacon_lost",
            ExitReason::RoomBeaconsWeak => "room_beacons_weak",
            ExitReason::RoomBeaconsLost => "room_beacons_lost",
        }
    }

    /// Whether the decision came from signal evidence rather than geometry
    pub fn is_forced(&self) -> bool {
        matches!(
            self,
            ExitReason::DoorSignalWeak
                | ExitReason::DoorBeaconLost
                | ExitReason::RoomBeaconsWeak
                | ExitReason::RoomBeaconsLost
        )
    }
}

/// Transient inside/outside verdict
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExitDecision {
    pub is_inside: bool,
    /// Normalized room coordinates; set only when forced outside
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_position: Option<Point>,
    pub reason: ExitReason,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_address_normalization() {
        assert_eq!(BeaconAddress::new("c3:00:1a:2b:3c:4d").as_str(), "C3001A2B3C4D");
        assert_eq!(BeaconAddress::new("C3-00-1A-2B-3C-4D").as_str(), "C3001A2B3C4D");
        assert!(BeaconAddress::new("ff:ff:ff:ff:ff:ff").is_sentinel());
        assert!(!BeaconAddress::new("c3:00:1a:2b:3c:4d").is_sentinel());
    }

    #[test]
    fn test_address_deserialize_normalizes() {
        let addr: BeaconAddress = serde_json::from_str("\"aa:bb:cc:dd:ee:01\"").unwrap();
        assert_eq!(addr.as_str(), "AABBCCDDEE01");
    }

    #[test]
    fn test_snapshot_drops_sentinels() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let record = FeedRecord::new("dev1", ts)
            .with_reading("aa:bb:cc:dd:ee:01", -60)
            .with_reading("ff:ff:ff:ff:ff:ff", -70)
            .with_reading("aa:bb:cc:dd:ee:02", -1);

        let snapshot = record.snapshot();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&BeaconAddress::new("AABBCCDDEE01")), Some(&-60.0));
    }

    #[test]
    fn test_latest_measurement() {
        let early = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap();
        let point = CalibrationPoint::new("p1", "bed", Point::new(0.5, 0.5))
            .with_measurement(Measurement {
                device_id: "dev1".to_string(),
                timestamp: late,
                readings: Snapshot::new(),
            })
            .with_measurement(Measurement {
                device_id: "dev1".to_string(),
                timestamp: early,
                readings: Snapshot::new(),
            });

        assert_eq!(point.latest_measurement().unwrap().timestamp, late);
    }

    #[test]
    fn test_device_events_from_status() {
        let events = DeviceEvents::from_status(0x000048);
        assert!(events.shock);
        assert!(events.sos);
        assert!(!events.start_moving);
        assert!(events.motion_detected());
        assert_eq!(events.primary(), Some("shock"));
        assert_eq!(DeviceEvents::from_status(0).primary(), None);
    }

    #[test]
    fn test_off_zone_point_round_trips() {
        let point = CalibrationPoint::new("door-out", "Door (outside)", Point::new(0.5, 1.2))
            .with_tag(PointTag::DoorOutside);
        let json = serde_json::to_string(&point).unwrap();
        let back: CalibrationPoint = serde_json::from_str(&json).unwrap();

        assert_eq!(back, point);
        assert!(!back.position.is_normalized());
    }
}
