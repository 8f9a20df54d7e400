//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `feed_hub` - Push-subscribable per-device telemetry feed
//! - `t1000` - Tracker payload decoder
//! - `uplink` - Network-server uplink envelope parsing
//! - `mqtt` - MQTT client feeding decoded uplinks into the hub
//! - `store` - Calibration document store (rooms, beacons, devices)
//! - `egress` - Alert history output to file (JSONL format)
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `mqtt_egress` - MQTT publisher for egress events
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod egress_channel;
pub mod feed_hub;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;
pub mod store;
pub mod t1000;
pub mod uplink;

// Re-export commonly used types
pub use egress_channel::{create_egress_channel, EgressSender};
pub use feed_hub::{FeedHub, Subscription};
pub use mqtt_egress::MqttPublisher;
pub use store::{CalibrationStore, JsonFileStore, MemoryStore, StoreDocument};
