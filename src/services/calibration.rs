//! Calibration session for one room
//!
//! Adds reference points, records fresh measurements at them and configures
//! door beacons, writing each change back to the store. Measurements are
//! appended, never replaced; the latest one is what estimation uses.

use crate::domain::error::TrackingError;
use crate::domain::geometry::DoorGeometry;
use crate::domain::types::{new_uuid_v7, CalibrationPoint, Measurement, Point, PointTag, RoomProfile};
use crate::io::store::CalibrationStore;
use crate::services::acquisition::{Acquirer, Acquisition};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct CalibrationSession {
    store: Arc<dyn CalibrationStore>,
    acquirer: Acquirer,
    room_id: String,
    timeout: Duration,
}

impl CalibrationSession {
    pub fn new(
        store: Arc<dyn CalibrationStore>,
        acquirer: Acquirer,
        room_id: &str,
        timeout: Duration,
    ) -> Self {
        Self { store, acquirer, room_id: room_id.to_string(), timeout }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn room(&self) -> Result<RoomProfile> {
        let doc = self.store.load().await?;
        Ok(doc.require_room(&self.room_id)?.clone())
    }

    /// Add a reference point at a normalized position
    ///
    /// Positions outside [0,1] are stored as given (off-zone references).
    pub async fn add_point(
        &self,
        label: &str,
        position: Point,
        tag: Option<PointTag>,
    ) -> Result<CalibrationPoint> {
        let mut room = self.room().await?;

        let mut point = CalibrationPoint::new(&new_uuid_v7(), label, position);
        point.tag = tag;

        if let Some(tag) = tag {
            // One point per door role; the newer point replaces the tag
            for existing in room.calibration_points.iter_mut().filter(|p| p.tag == Some(tag)) {
                warn!(room_id = %self.room_id, point_id = %existing.id, tag = ?tag, "door_tag_moved");
                existing.tag = None;
            }
        }

        room.calibration_points.push(point.clone());
        room.touch();
        self.store.save_room(&room).await?;

        info!(
            room_id = %self.room_id,
            point_id = %point.id,
            label = %label,
            x = position.x,
            y = position.y,
            off_zone = !position.is_normalized(),
            "calibration_point_added"
        );
        Ok(point)
    }

    /// Start an acquisition for a point, validating the point first
    pub async fn start_measurement(&self, point_id: &str, device_id: &str) -> Result<Acquisition> {
        let room = self.room().await?;
        if !room.calibration_points.iter().any(|p| p.id == point_id) {
            return Err(TrackingError::UnknownCalibrationPoint(point_id.to_string()).into());
        }
        Ok(self.acquirer.acquire(device_id, self.timeout)?)
    }

    /// Wait for an acquisition and append its measurement to the point
    pub async fn finish_measurement(
        &self,
        point_id: &str,
        acquisition: Acquisition,
    ) -> Result<Measurement> {
        let measurement = acquisition.outcome().await?;
        self.append_measurement(point_id, measurement.clone()).await?;
        Ok(measurement)
    }

    /// Acquire one fresh sample from the device and record it at the point
    pub async fn record_measurement(&self, point_id: &str, device_id: &str) -> Result<Measurement> {
        let acquisition = self.start_measurement(point_id, device_id).await?;
        self.finish_measurement(point_id, acquisition).await
    }

    pub async fn append_measurement(&self, point_id: &str, measurement: Measurement) -> Result<()> {
        // Reload: the document may have changed while the acquisition ran
        let mut room = self.room().await?;
        let point = room
            .calibration_point_mut(point_id)
            .ok_or_else(|| TrackingError::UnknownCalibrationPoint(point_id.to_string()))?;

        let readings = measurement.readings.len();
        point.measurements.push(measurement);
        let total = point.measurements.len();
        room.touch();
        self.store.save_room(&room).await?;

        info!(
            room_id = %self.room_id,
            point_id = %point_id,
            readings,
            measurements = total,
            "measurement_recorded"
        );
        Ok(())
    }

    /// Replace the room's door beacon configuration
    ///
    /// Every id must exist in the beacon registry. An empty list falls back
    /// to the room-beacon override.
    pub async fn set_door_beacons(&self, beacon_ids: &[String]) -> Result<()> {
        let doc = self.store.load().await?;
        let mut room = doc.require_room(&self.room_id)?.clone();

        if let Some(unknown) = beacon_ids.iter().find(|id| doc.beacon(id).is_none()) {
            return Err(TrackingError::UnknownBeacon(unknown.clone()).into());
        }

        room.door_beacon_ids = beacon_ids.to_vec();
        room.touch();
        self.store.save_room(&room).await?;

        info!(room_id = %self.room_id, door_beacons = ?beacon_ids, "door_beacons_set");
        Ok(())
    }

    /// Door geometry derived from the tagged point pair
    pub async fn door_geometry(&self) -> Result<DoorGeometry> {
        let room = self.room().await?;
        Ok(DoorGeometry::from_points(&room.calibration_points, room.outline)?)
    }
}
