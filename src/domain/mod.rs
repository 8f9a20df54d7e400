//! Domain models - core types shared by estimation, exit detection and alerts
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - beacons, rooms, calibration points, measurements, feed records
//! - `alert` - user-facing warnings and their dedup identity
//! - `geometry` - outline containment and derived door geometry
//! - `error` - the tracking error taxonomy

pub mod alert;
pub mod error;
pub mod geometry;
pub mod types;

// Re-export commonly used types at module level
pub use alert::{Alert, AlertId, AlertType};
pub use error::TrackingError;
pub use geometry::DoorGeometry;
pub use types::{
    Beacon, BeaconAddress, CalibrationPoint, CoordSpace, Device, DeviceEvents, EstimateMethod,
    ExitDecision, ExitReason, FeedRecord, Measurement, Outline, Point, PointTag, PositionEstimate,
    Reading, RoomProfile, Snapshot,
};
