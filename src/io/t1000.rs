//! SenseCAP T1000 uplink payload decoder
//!
//! Only frame 0x08 (Bluetooth location and sensor) is decoded in full:
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 1    | frame id                           |
//! | 1      | 3    | event status (BE)                  |
//! | 4      | 1    | motion segment                     |
//! | 5      | 4    | UTC seconds (BE)                   |
//! | 9      | 7    | beacon 1: MAC (6) + RSSI (i8)      |
//! | 16     | 7    | beacon 2                           |
//! | 23     | 7    | beacon 3                           |
//! | 30     | 2    | temperature, 0.1 °C (BE, signed)   |
//! | 32     | 2    | light, percent (BE)                |
//! | 34     | 1    | battery, percent                   |
//!
//! Other frame ids decode to a header only.

use crate::domain::types::{BeaconAddress, DeviceEvents, FeedRecord, Reading};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use smallvec::SmallVec;

/// Bluetooth location and sensor frame
pub const FRAME_BLE_LOCATION: u8 = 0x08;

const BLE_FRAME_MIN_LEN: usize = 35;
const BEACON_OFFSETS: [usize; 3] = [9, 16, 23];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid hex payload: {0}")]
    InvalidHex(String),

    #[error("empty payload")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeaconSlot {
    pub address: BeaconAddress,
    pub rssi: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BleLocation {
    pub event_status: u32,
    pub events: DeviceEvents,
    pub motion_segment: u8,
    pub utc: u32,
    pub beacons: [BeaconSlot; 3],
    pub temperature_c: f64,
    pub light_pct: u16,
    pub battery_pct: u8,
}

impl BleLocation {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(i64::from(self.utc), 0).single()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct T1000Frame {
    pub frame_id: u8,
    pub length: usize,
    /// Present for a complete 0x08 frame
    pub location: Option<BleLocation>,
}

impl T1000Frame {
    /// Feed record for a location frame; `None` for other frames
    ///
    /// All three slots are carried, including empty ones; consumers filter
    /// through `Reading::is_valid`.
    pub fn to_feed_record(&self, device_id: &str) -> Option<FeedRecord> {
        let loc = self.location.as_ref()?;
        let timestamp = loc.timestamp()?;

        let readings: SmallVec<[Reading; 3]> = loc
            .beacons
            .iter()
            .map(|b| Reading { address: b.address.clone(), rssi: b.rssi })
            .collect();

        Some(FeedRecord {
            device_id: device_id.to_string(),
            timestamp,
            readings,
            battery_pct: Some(loc.battery_pct),
            temperature_c: Some(loc.temperature_c),
            light_pct: Some(loc.light_pct),
            events: loc.events,
        })
    }
}

pub fn decode_hex(payload: &str) -> Result<T1000Frame, DecodeError> {
    let bytes = hex::decode(payload.trim()).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
    decode(&bytes)
}

pub fn decode(b: &[u8]) -> Result<T1000Frame, DecodeError> {
    let frame_id = *b.first().ok_or(DecodeError::Empty)?;

    let location = if frame_id == FRAME_BLE_LOCATION && b.len() >= BLE_FRAME_MIN_LEN {
        let event_status = u32::from_be_bytes([0, b[1], b[2], b[3]]);
        let beacons = BEACON_OFFSETS.map(|off| BeaconSlot {
            address: BeaconAddress::new(&hex::encode_upper(&b[off..off + 6])),
            rssi: i32::from(b[off + 6] as i8),
        });

        Some(BleLocation {
            event_status,
            events: DeviceEvents::from_status(event_status),
            motion_segment: b[4],
            utc: u32::from_be_bytes([b[5], b[6], b[7], b[8]]),
            beacons,
            temperature_c: f64::from(i16::from_be_bytes([b[30], b[31]])) / 10.0,
            light_pct: u16::from_be_bytes([b[32], b[33]]),
            battery_pct: b[34],
        })
    } else {
        None
    };

    Ok(T1000Frame { frame_id, length: b.len(), location })
}
