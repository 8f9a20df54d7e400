//! Integration tests for the JSON file store

use tempfile::TempDir;
use zone_guard::domain::types::{Beacon, Device, Point, RoomProfile};
use zone_guard::domain::CalibrationPoint;
use zone_guard::io::store::{CalibrationStore, JsonFileStore, StoreDocument};

fn sample_doc() -> StoreDocument {
    let mut bedroom = RoomProfile::new("bedroom", "Bedroom");
    bedroom.beacon_ids = vec!["b1".to_string()];
    bedroom.calibration_points.push(CalibrationPoint::new("p1", "bed", Point::new(0.8, 0.2)));

    StoreDocument {
        beacons: vec![Beacon::new("b1", "C3:00:00:00:00:01").with_position(1.0, 2.0)],
        rooms: vec![bedroom, RoomProfile::new("kitchen", "Kitchen")],
        devices: vec![Device {
            id: "dev1".to_string(),
            hardware_id: "2CF7F1C0530001A2".to_string(),
            name: "Rex".to_string(),
            status: Default::default(),
        }],
    }
}

#[tokio::test]
async fn test_missing_file_loads_empty() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::new(dir.path().join("store.json"));

    assert_eq!(store.load().await.unwrap(), StoreDocument::default());
}

#[tokio::test]
async fn test_write_then_load() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::new(dir.path().join("nested").join("store.json"));
    let doc = sample_doc();

    store.write_document(&doc).await.unwrap();

    assert_eq!(store.load().await.unwrap(), doc);
}

#[tokio::test]
async fn test_save_room_keeps_other_rooms() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::new(dir.path().join("store.json"));
    store.write_document(&sample_doc()).await.unwrap();

    let mut kitchen = RoomProfile::new("kitchen", "Kitchen");
    kitchen.door_beacon_ids = vec!["b1".to_string()];
    store.save_room(&kitchen).await.unwrap();

    let doc = store.load().await.unwrap();
    assert_eq!(doc.rooms.len(), 2);
    assert_eq!(doc.room("kitchen").unwrap().door_beacon_ids, vec!["b1".to_string()]);
    assert_eq!(doc.room("bedroom").unwrap().calibration_points.len(), 1);
    assert_eq!(doc.devices.len(), 1);
}

#[tokio::test]
async fn test_corrupt_file_is_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(JsonFileStore::new(&path).load().await.is_err());
}
