//! Network-server uplink envelope parsing
//!
//! Accepts the uplink JSON as published by the LoRaWAN network server, either
//! directly or wrapped in a push envelope `{"message": {"data": <base64 uplink>,
//! "attributes": {...}, "messageId": ...}}`. The uplink's own `data` field is
//! the base64 device payload handed to the T1000 decoder.

use crate::domain::types::FeedRecord;
use crate::io::t1000::{self, DecodeError, T1000Frame};
use base64::{engine::general_purpose::STANDARD, Engine};
use rustc_hash::FxHasher;
use serde_json::{Map, Value};
use std::hash::{Hash, Hasher};
use tracing::debug;

/// DevEUI used when neither the uplink nor the attributes carry one
pub const UNKNOWN_DEV_EUI: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("envelope data is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("payload decode failed: {0}")]
    Decode(#[from] DecodeError),
}

/// One parsed uplink
#[derive(Debug, Clone)]
pub struct Uplink {
    pub dev_eui: String,
    /// Stable key for redelivery detection
    pub dedup_key: String,
    /// Decoded device payload, absent when the uplink carried no data
    pub frame: Option<T1000Frame>,
}

impl Uplink {
    pub fn to_feed_record(&self, device_id: &str) -> Option<FeedRecord> {
        self.frame.as_ref()?.to_feed_record(device_id)
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str)).filter(|s| !s.is_empty())
}

/// Characters that cannot appear in a document path segment
fn safe_key(raw: &str) -> String {
    raw.chars().map(|c| if matches!(c, '.' | '#' | '$' | '/' | '[' | ']') { '_' } else { c }).collect()
}

fn payload_hash(uplink: &Value, publish_time: Option<&str>) -> String {
    let mut hasher = FxHasher::default();
    uplink.to_string().hash(&mut hasher);
    publish_time.unwrap_or_default().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn parse(body: &[u8]) -> Result<Uplink, UplinkError> {
    let root: Value = serde_json::from_slice(body)?;
    let Value::Object(root) = root else {
        return Err(UplinkError::NotAnObject);
    };

    // Push envelope: outer message with the uplink JSON base64-encoded in `data`
    let wrapped = root.get("message").and_then(Value::as_object).cloned();
    let (msg, uplink) = match wrapped {
        Some(msg) => {
            let uplink = match str_field(&msg, &["data"]) {
                Some(data) => {
                    let text = String::from_utf8(STANDARD.decode(data)?)?;
                    serde_json::from_str(&text)?
                }
                None => Value::Object(Map::new()),
            };
            (Some(msg), uplink)
        }
        None => (None, Value::Object(root)),
    };

    let empty = Map::new();
    let attrs =
        msg.as_ref().and_then(|m| m.get("attributes")).and_then(Value::as_object).unwrap_or(&empty);
    let up = uplink.as_object().unwrap_or(&empty);

    let dev_eui = up
        .get("deviceInfo")
        .and_then(Value::as_object)
        .and_then(|info| str_field(info, &["devEui"]))
        .or_else(|| str_field(attrs, &["devEui", "dev_eui"]))
        .unwrap_or(UNKNOWN_DEV_EUI)
        .to_string();

    let message_id = msg.as_ref().and_then(|m| str_field(m, &["messageId", "message_id"]));
    let publish_time = msg.as_ref().and_then(|m| str_field(m, &["publishTime", "publish_time"]));
    let dedup = str_field(up, &["deduplicationId"])
        .or_else(|| str_field(attrs, &["deduplicationId"]))
        .or(message_id)
        .map(str::to_string)
        .unwrap_or_else(|| payload_hash(&uplink, publish_time));

    let frame = match str_field(up, &["data"]) {
        Some(data) => Some(t1000::decode(&STANDARD.decode(data)?)?),
        None => None,
    };

    debug!(
        dev_eui = %dev_eui,
        dedup = %dedup,
        frame_id = ?frame.as_ref().map(|f| f.frame_id),
        "uplink_parsed"
    );

    Ok(Uplink { dev_eui, dedup_key: safe_key(&dedup), frame })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::t1000::tests::SAMPLE_HEX;

    fn inner_b64() -> String {
        STANDARD.encode(hex::decode(SAMPLE_HEX).unwrap())
    }

    #[test]
    fn test_parse_direct_uplink() {
        let body = serde_json::json!({
            "deduplicationId": "abc.123",
            "deviceInfo": { "devEui": "2cf7f1c0530001a2" },
            "data": inner_b64(),
        })
        .to_string();

        let uplink = parse(body.as_bytes()).unwrap();
        assert_eq!(uplink.dev_eui, "2cf7f1c0530001a2");
        assert_eq!(uplink.dedup_key, "abc_123");

        let record = uplink.to_feed_record("dev1").unwrap();
        assert_eq!(record.device_id, "dev1");
        assert_eq!(record.snapshot().len(), 2);
    }

    #[test]
    fn test_parse_push_envelope() {
        let uplink = serde_json::json!({
            "deviceInfo": { "devEui": "2cf7f1c0530001a2" },
            "data": inner_b64(),
        });
        let body = serde_json::json!({
            "message": {
                "data": STANDARD.encode(uplink.to_string()),
                "messageId": "m-42",
                "attributes": {},
            }
        })
        .to_string();

        let parsed = parse(body.as_bytes()).unwrap();
        assert_eq!(parsed.dev_eui, "2cf7f1c0530001a2");
        assert_eq!(parsed.dedup_key, "m-42");
        assert!(parsed.frame.unwrap().location.is_some());
    }

    #[test]
    fn test_dev_eui_from_attributes() {
        let body = serde_json::json!({
            "message": { "attributes": { "dev_eui": "AA01" } }
        })
        .to_string();

        let parsed = parse(body.as_bytes()).unwrap();
        assert_eq!(parsed.dev_eui, "AA01");
        assert!(parsed.frame.is_none());
        assert!(parsed.to_feed_record("dev1").is_none());
    }

    #[test]
    fn test_dedup_hash_is_stable() {
        let body = br#"{"fCnt": 7}"#;
        let a = parse(body).unwrap();
        let b = parse(body).unwrap();

        assert_eq!(a.dev_eui, UNKNOWN_DEV_EUI);
        assert_eq!(a.dedup_key, b.dedup_key);
        assert_eq!(a.dedup_key.len(), 16);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(b"not json"), Err(UplinkError::Json(_))));
        assert!(matches!(parse(b"[1,2]"), Err(UplinkError::NotAnObject)));
        assert!(matches!(parse(br#"{"data": "%%%"}"#), Err(UplinkError::Base64(_))));
        assert!(matches!(parse(br#"{"data": ""}"#), Ok(Uplink { frame: None, .. })));
    }
}
