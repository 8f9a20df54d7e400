//! Error taxonomy for the tracking core
//!
//! Estimation failures are recovered locally by callers (the cycle is
//! skipped), acquisition failures are surfaced to the calibration flow.

/// Errors produced by estimation, acquisition and door geometry
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackingError {
    /// No calibration point shares a beacon with the snapshot
    #[error("insufficient calibration data for fingerprinting")]
    InsufficientCalibrationData,

    /// Fewer fixed-position beacons with valid readings than trilateration needs
    #[error("insufficient fixed beacons: {usable} usable, {required} required")]
    InsufficientBeacons { usable: usize, required: usize },

    /// No fresh sample arrived within the acquisition window
    #[error("measurement timed out for device {device_id} after {timeout_ms} ms")]
    MeasurementTimeout { device_id: String, timeout_ms: u64 },

    /// The device feed could not be read
    #[error("subscription error: {0}")]
    SubscriptionError(String),

    /// Door-relative logic requested without a usable door pair
    #[error("invalid room geometry: {0}")]
    InvalidRoomGeometry(String),

    /// An acquisition for this device is already running
    #[error("acquisition already in flight for device {device_id}")]
    AcquisitionInFlight { device_id: String },

    /// The caller cancelled the acquisition before it resolved
    #[error("acquisition cancelled for device {device_id}")]
    AcquisitionCancelled { device_id: String },

    #[error("unknown room: {0}")]
    UnknownRoom(String),

    #[error("unknown calibration point: {0}")]
    UnknownCalibrationPoint(String),

    #[error("unknown beacon: {0}")]
    UnknownBeacon(String),
}

impl TrackingError {
    /// Whether the calibration flow should offer a retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackingError::MeasurementTimeout { .. }
                | TrackingError::SubscriptionError(_)
                | TrackingError::AcquisitionCancelled { .. }
        )
    }
}
