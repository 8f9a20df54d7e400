//! MQTT client for receiving tracker uplinks
//!
//! Subscribes to the network server's uplink topic, decodes each payload and
//! publishes the resulting feed record to the [`FeedHub`]. Redeliveries are
//! suppressed with a bounded window of recently seen dedup keys.

use crate::domain::types::Device;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::feed_hub::FeedHub;
use crate::io::uplink;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Bounded set of recently seen keys, oldest evicted first
pub struct DedupWindow {
    order: VecDeque<String>,
    seen: FxHashSet<String>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: FxHashSet::default(),
            capacity,
        }
    }

    /// Returns true if the key is new (and remembers it)
    pub fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What happened to one MQTT payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Record published, with the number of hub listeners reached
    Published { device_id: String, listeners: usize },
    Duplicate,
    /// Uplink parsed but carried no location frame
    NoLocation,
    Invalid,
}

/// Turns raw uplink payloads into hub records
pub struct UplinkIngest {
    hub: FeedHub,
    /// Lowercase DevEUI to device id
    resolver: FxHashMap<String, String>,
    dedup: DedupWindow,
    metrics: Arc<Metrics>,
}

impl UplinkIngest {
    pub fn new(
        hub: FeedHub,
        resolver: FxHashMap<String, String>,
        dedup_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { hub, resolver, dedup: DedupWindow::new(dedup_capacity), metrics }
    }

    /// Build a DevEUI resolver from registered devices
    pub fn resolver_from(devices: &[Device]) -> FxHashMap<String, String> {
        devices.iter().map(|d| (d.hardware_id.to_ascii_lowercase(), d.id.clone())).collect()
    }

    /// Device id for a DevEUI; unregistered trackers keep their DevEUI
    pub fn resolve(&self, dev_eui: &str) -> String {
        let key = dev_eui.to_ascii_lowercase();
        match self.resolver.get(&key) {
            Some(id) => id.clone(),
            None => key,
        }
    }

    pub fn handle_payload(&mut self, payload: &[u8]) -> IngestOutcome {
        let parsed = match uplink::parse(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.metrics.record_uplink_invalid();
                warn!(error = %e, "uplink_invalid");
                return IngestOutcome::Invalid;
            }
        };

        if !self.dedup.insert(&parsed.dedup_key) {
            self.metrics.record_uplink_duplicate();
            debug!(dedup = %parsed.dedup_key, "uplink_duplicate");
            return IngestOutcome::Duplicate;
        }

        let device_id = self.resolve(&parsed.dev_eui);
        let Some(record) = parsed.to_feed_record(&device_id) else {
            debug!(dev_eui = %parsed.dev_eui, "uplink_without_location");
            return IngestOutcome::NoLocation;
        };

        let listeners = self.hub.publish(record);
        debug!(device = %device_id, listeners = %listeners, "uplink_published");
        IngestOutcome::Published { device_id, listeners }
    }
}

/// Start the MQTT client and feed decoded uplinks into the hub
///
/// Runs until the shutdown signal is received. Connection errors are logged
/// and retried after a short pause.
pub async fn start_mqtt_ingest(
    config: &Config,
    mut ingest: UplinkIngest,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_id = format!("{}-ingest-{}", config.mqtt_client_id(), std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_max_packet_size(64 * 1024, 64 * 1024);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_topic(), QoS::AtLeastOnce).await?;

    info!(
        topic = %config.mqtt_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_ingest_subscribed"
    );

    // Rate-limit invalid payload warnings to 1 per second
    let mut last_invalid_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_ingest_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let outcome = ingest.handle_payload(&publish.payload);
                        if outcome == IngestOutcome::Invalid
                            && last_invalid_warn.elapsed() > Duration::from_secs(1)
                        {
                            warn!(topic = %publish.topic, "mqtt_ingest_invalid_payload");
                            last_invalid_warn = Instant::now();
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_ingest_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_ingest_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::t1000::tests::SAMPLE_HEX;
    use base64::{engine::general_purpose::STANDARD, Engine};

    fn uplink_body(dedup: &str, dev_eui: &str) -> Vec<u8> {
        serde_json::json!({
            "deduplicationId": dedup,
            "deviceInfo": { "devEui": dev_eui },
            "data": STANDARD.encode(hex::decode(SAMPLE_HEX).unwrap()),
        })
        .to_string()
        .into_bytes()
    }

    fn ingest(hub: &FeedHub, metrics: &Arc<Metrics>) -> UplinkIngest {
        let devices = vec![Device {
            id: "tag-1".to_string(),
            hardware_id: "2CF7F1C0530001A2".to_string(),
            name: "Tag".to_string(),
            status: Default::default(),
        }];
        UplinkIngest::new(hub.clone(), UplinkIngest::resolver_from(&devices), 2, metrics.clone())
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        assert!(window.insert("a"));
        assert!(window.insert("b"));
        assert!(!window.insert("a"));
        assert!(window.insert("c"));
        assert_eq!(window.len(), 2);
        // "a" was evicted by "c"
        assert!(window.insert("a"));
        assert!(!window.insert("c"));
    }

    #[test]
    fn test_publishes_resolved_device() {
        let hub = FeedHub::new();
        let metrics = Arc::new(Metrics::new());
        let mut ingest = ingest(&hub, &metrics);

        let outcome = ingest.handle_payload(&uplink_body("d1", "2cf7f1c0530001a2"));

        assert_eq!(
            outcome,
            IngestOutcome::Published { device_id: "tag-1".to_string(), listeners: 0 }
        );
        let latest = hub.latest("tag-1").unwrap();
        assert_eq!(latest.snapshot().len(), 2);
    }

    #[test]
    fn test_duplicates_and_invalid_are_counted() {
        let hub = FeedHub::new();
        let metrics = Arc::new(Metrics::new());
        let mut ingest = ingest(&hub, &metrics);

        ingest.handle_payload(&uplink_body("d1", "2cf7f1c0530001a2"));
        assert_eq!(
            ingest.handle_payload(&uplink_body("d1", "2cf7f1c0530001a2")),
            IngestOutcome::Duplicate
        );
        assert_eq!(ingest.handle_payload(b"garbage"), IngestOutcome::Invalid);

        assert_eq!(metrics.uplinks_duplicate_total(), 1);
        assert_eq!(metrics.uplinks_invalid_total(), 1);
    }

    #[test]
    fn test_unregistered_device_keeps_dev_eui() {
        let hub = FeedHub::new();
        let metrics = Arc::new(Metrics::new());
        let mut ingest = ingest(&hub, &metrics);

        match ingest.handle_payload(&uplink_body("d2", "AABBCCDD00112233")) {
            IngestOutcome::Published { device_id, .. } => assert_eq!(device_id, "aabbccdd00112233"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_uplink_without_data() {
        let hub = FeedHub::new();
        let metrics = Arc::new(Metrics::new());
        let mut ingest = ingest(&hub, &metrics);

        let body = br#"{"deduplicationId": "x", "deviceInfo": {"devEui": "2cf7f1c0530001a2"}}"#;
        assert_eq!(ingest.handle_payload(body), IngestOutcome::NoLocation);
        assert!(hub.latest("tag-1").is_none());
    }
}
