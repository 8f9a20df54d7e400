//! Services - business logic and state management
//!
//! This module contains the core services:
//! - `estimator` - Fingerprint and trilateration position estimation
//! - `exit_detector` - Inside/outside decisions and exit display placement
//! - `alerts` - Alert lifecycle (dedup, auto-dismiss, dismissal)
//! - `acquisition` - One-shot fresh measurement from a device feed
//! - `calibration` - Calibration session over the document store
//! - `monitor` - Live tracking loop over all assigned devices

pub mod acquisition;
pub mod alerts;
pub mod calibration;
pub mod estimator;
pub mod exit_detector;
pub mod monitor;

// Re-export commonly used types
pub use acquisition::{Acquirer, Acquisition, CancelHandle};
pub use alerts::AlertCenter;
pub use calibration::CalibrationSession;
pub use estimator::PositionEstimator;
pub use exit_detector::ExitDetector;
pub use monitor::Monitor;
