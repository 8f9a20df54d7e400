//! Boundary and exit detection
//!
//! Decides whether a device is inside its room:
//! - Default rule: the estimate lies within the outline grown by a margin
//! - Door override: weak or missing door-beacon signal forces "outside",
//!   regardless of the geometric estimate
//! - Fallback override: with no door beacon configured, the first room
//!   beacons are checked against the same threshold, and losing all of
//!   them while other beacons are heard also forces "outside"
//!
//! Decisions are pure. The set of currently exited devices is passed in as
//! an `ExitRoster` so the exit-zone layout depends only on its inputs.

use crate::domain::geometry::DoorGeometry;
use crate::domain::types::{
    BeaconAddress, CoordSpace, ExitDecision, ExitReason, Outline, Point, PositionEstimate,
    Snapshot,
};
use tracing::debug;

/// Tunables for exit detection and exit-zone layout
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Outline expansion on every side (meters)
    pub margin_m: f64,
    /// Door signal average below this forces "outside" (dBm)
    pub door_threshold_dbm: f64,
    /// Number of room beacons used when no door beacon is configured
    pub fallback_beacon_count: usize,
    /// Distance from the door midpoint to the first exit row (meters)
    pub exit_depth_m: f64,
    /// Devices per exit row
    pub row_size: usize,
    /// Lateral gap between devices in a row (meters)
    pub lateral_spacing_m: f64,
    /// Gap between consecutive rows (meters)
    pub row_spacing_m: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            margin_m: 0.5,
            door_threshold_dbm: -80.0,
            fallback_beacon_count: 2,
            exit_depth_m: 1.5,
            row_size: 5,
            lateral_spacing_m: 0.5,
            row_spacing_m: 0.5,
        }
    }
}

/// Room data needed for one decision
#[derive(Debug, Clone, Copy)]
pub struct ZoneView<'a> {
    pub outline: Option<Outline>,
    /// Ordered room beacon addresses
    pub room_beacons: &'a [BeaconAddress],
    /// Door-adjacent beacon addresses; empty if none configured
    pub door_beacons: &'a [BeaconAddress],
    /// Derived door segment, if the room has a valid door pair
    pub door: Option<DoorGeometry>,
}

/// Devices currently judged outside one room, in exit order
#[derive(Debug, Clone, Default)]
pub struct ExitRoster {
    order: Vec<String>,
}

impl ExitRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device; returns false if it was already listed
    pub fn insert(&mut self, device_id: &str) -> bool {
        if self.contains(device_id) {
            return false;
        }
        self.order.push(device_id.to_string());
        true
    }

    /// Remove a device; returns false if it was not listed
    pub fn remove(&mut self, device_id: &str) -> bool {
        let before = self.order.len();
        self.order.retain(|d| d != device_id);
        self.order.len() != before
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.order.iter().any(|d| d == device_id)
    }

    /// Layout slot of a device; unlisted devices get the next free slot
    pub fn slot_for(&self, device_id: &str) -> usize {
        self.order.iter().position(|d| d == device_id).unwrap_or(self.order.len())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn devices(&self) -> &[String] {
        &self.order
    }
}

/// Stateless exit detector
#[derive(Debug, Clone, Default)]
pub struct ExitDetector {
    config: ExitConfig,
}

impl ExitDetector {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Decide inside/outside for one device
    ///
    /// Returns `None` only when there is no estimate and no signal override,
    /// in which case the caller skips this cycle.
    pub fn decide(
        &self,
        device_id: &str,
        estimate: Option<&PositionEstimate>,
        zone: &ZoneView<'_>,
        snapshot: &Snapshot,
        roster: &ExitRoster,
    ) -> Option<ExitDecision> {
        if let Some(reason) = self.signal_override(zone, snapshot) {
            let display_position = zone
                .door
                .map(|door| self.exit_position(&door, zone.outline, roster.slot_for(device_id)));
            if display_position.is_none() {
                debug!(device_id = %device_id, "exit_without_door_geometry");
            }
            return Some(ExitDecision { is_inside: false, display_position, reason });
        }

        let estimate = estimate?;
        let inside = self.is_within_outline(estimate, zone.outline);
        Some(ExitDecision {
            is_inside: inside,
            display_position: None,
            reason: if inside { ExitReason::WithinOutline } else { ExitReason::OutsideOutline },
        })
    }

    /// Geometric rule: estimate within outline + margin
    pub fn is_within_outline(&self, estimate: &PositionEstimate, outline: Option<Outline>) -> bool {
        let extent = Outline::or_unit(outline);
        let meters = match estimate.space {
            CoordSpace::Normalized => extent.to_meters(estimate.position),
            CoordSpace::Meters => estimate.position,
        };
        extent.contains_with_margin(meters, self.config.margin_m)
    }

    /// Direct signal evidence that the device left, if any
    pub fn signal_override(&self, zone: &ZoneView<'_>, snapshot: &Snapshot) -> Option<ExitReason> {
        if !zone.door_beacons.is_empty() {
            return self.door_override(zone.door_beacons, snapshot);
        }

        let fallback_beacons: Vec<&BeaconAddress> =
            zone.room_beacons.iter().take(self.config.fallback_beacon_count).collect();
        if fallback_beacons.is_empty() {
            return None;
        }
        let fallback: Vec<f64> =
            fallback_beacons.iter().filter_map(|addr| snapshot.get(*addr).copied()).collect();
        if fallback.is_empty() {
            let others_heard = snapshot.keys().any(|addr| !fallback_beacons.contains(&addr));
            return others_heard.then_some(ExitReason::RoomBeaconsLost);
        }
        let sum: f64 = fallback.iter().sum();
        if sum < self.config.door_threshold_dbm * fallback.len() as f64 {
            return Some(ExitReason::RoomBeaconsWeak);
        }
        None
    }

    fn door_override(&self, door_beacons: &[BeaconAddress], snapshot: &Snapshot) -> Option<ExitReason> {
        let heard: Vec<f64> =
            door_beacons.iter().filter_map(|addr| snapshot.get(addr).copied()).collect();

        if heard.is_empty() {
            let others_heard = snapshot.keys().any(|addr| !door_beacons.contains(addr));
            return others_heard.then_some(ExitReason::DoorBeaconLost);
        }

        let avg = heard.iter().sum::<f64>() / heard.len() as f64;
        (avg < self.config.door_threshold_dbm).then_some(ExitReason::DoorSignalWeak)
    }

    /// Display position for an exited device, in normalized room space
    ///
    /// Rows of `row_size` devices stack outward from the door; within a row
    /// devices spread along the door, centered on its midpoint.
    pub fn exit_position(&self, door: &DoorGeometry, outline: Option<Outline>, slot: usize) -> Point {
        let row_size = self.config.row_size.max(1);
        let row = (slot / row_size) as f64;
        let col = (slot % row_size) as f64;

        let depth = self.config.exit_depth_m + row * self.config.row_spacing_m;
        let lateral = (col - (row_size as f64 - 1.0) / 2.0) * self.config.lateral_spacing_m;
        let tangent = door.tangent();

        let meters = Point::new(
            door.midpoint.x + door.normal.x * depth + tangent.x * lateral,
            door.midpoint.y + door.normal.y * depth + tangent.y * lateral,
        );
        Outline::or_unit(outline).to_normalized(meters)
    }
}
