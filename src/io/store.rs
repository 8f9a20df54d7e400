//! Calibration document store
//!
//! Holds the beacon registry, room profiles and the device registry as one
//! JSON document. `JsonFileStore` persists it to a local file; `MemoryStore`
//! keeps it in memory for tests and dry runs.

use crate::domain::error::TrackingError;
use crate::domain::types::{Beacon, BeaconAddress, Device, RoomProfile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The whole stored document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub beacons: Vec<Beacon>,
    #[serde(default)]
    pub rooms: Vec<RoomProfile>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl StoreDocument {
    pub fn room(&self, room_id: &str) -> Option<&RoomProfile> {
        self.rooms.iter().find(|r| r.id == room_id)
    }

    pub fn room_mut(&mut self, room_id: &str) -> Option<&mut RoomProfile> {
        self.rooms.iter_mut().find(|r| r.id == room_id)
    }

    pub fn beacon(&self, beacon_id: &str) -> Option<&Beacon> {
        self.beacons.iter().find(|b| b.id == beacon_id)
    }

    /// Registry beacons of a room, in the room's order; unknown ids are skipped
    pub fn room_beacons(&self, room: &RoomProfile) -> Vec<Beacon> {
        room.beacon_ids
            .iter()
            .filter_map(|id| {
                let beacon = self.beacon(id);
                if beacon.is_none() {
                    warn!(room_id = %room.id, beacon_id = %id, "room_beacon_not_in_registry");
                }
                beacon.cloned()
            })
            .collect()
    }

    /// Addresses of the room's door beacons
    pub fn door_addresses(&self, room: &RoomProfile) -> Vec<BeaconAddress> {
        room.door_beacon_ids
            .iter()
            .filter_map(|id| self.beacon(id))
            .map(|b| b.address.clone())
            .collect()
    }

    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == device_id)
    }

    /// Resolve a tracker's DevEUI to the registered device
    pub fn device_by_hardware_id(&self, hardware_id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.hardware_id.eq_ignore_ascii_case(hardware_id))
    }

    /// Replace a room by id, or append it if new
    pub fn upsert_room(&mut self, room: RoomProfile) {
        match self.room_mut(&room.id) {
            Some(existing) => *existing = room,
            None => self.rooms.push(room),
        }
    }

    pub fn require_room(&self, room_id: &str) -> Result<&RoomProfile, TrackingError> {
        self.room(room_id).ok_or_else(|| TrackingError::UnknownRoom(room_id.to_string()))
    }
}

/// Read/write access to the calibration document
#[async_trait]
pub trait CalibrationStore: Send + Sync {
    async fn load(&self) -> Result<StoreDocument>;

    /// Write one room back, leaving the rest of the document untouched
    async fn save_room(&self, room: &RoomProfile) -> Result<()>;
}

/// Document persisted as pretty JSON on the local filesystem
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), write_lock: tokio::sync::Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<StoreDocument> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            warn!(path = %self.path.display(), "store_missing_using_empty");
            return Ok(StoreDocument::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read store file: {}", self.path.display()))?;
        let doc: StoreDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse store file: {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            rooms = doc.rooms.len(),
            beacons = doc.beacons.len(),
            devices = doc.devices.len(),
            "store_loaded"
        );
        Ok(doc)
    }

    /// Write the whole document (temp file then rename)
    pub async fn write_document(&self, doc: &StoreDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string_pretty(doc).context("Failed to serialize store")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write store file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace store file: {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl CalibrationStore for JsonFileStore {
    async fn load(&self) -> Result<StoreDocument> {
        self.read_document().await
    }

    async fn save_room(&self, room: &RoomProfile) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.upsert_room(room.clone());
        self.write_document(&doc).await?;

        info!(
            path = %self.path.display(),
            room_id = %room.id,
            calibration_points = room.calibration_points.len(),
            "room_saved"
        );
        Ok(())
    }
}

/// In-memory document
#[derive(Default)]
pub struct MemoryStore {
    doc: Mutex<StoreDocument>,
}

impl MemoryStore {
    pub fn new(doc: StoreDocument) -> Self {
        Self { doc: Mutex::new(doc) }
    }

    pub fn snapshot(&self) -> StoreDocument {
        self.doc.lock().clone()
    }
}

#[async_trait]
impl CalibrationStore for MemoryStore {
    async fn load(&self) -> Result<StoreDocument> {
        Ok(self.doc.lock().clone())
    }

    async fn save_room(&self, room: &RoomProfile) -> Result<()> {
        self.doc.lock().upsert_room(room.clone());
        Ok(())
    }
}
