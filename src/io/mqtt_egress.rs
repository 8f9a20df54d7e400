//! MQTT publisher for egress events
//!
//! Publishes monitor output to MQTT topics for downstream consumers:
//! - zone-guard/alerts - Alert raised/dismissed/expired (QoS 1)
//! - zone-guard/positions - Live estimates and exit decisions (QoS 0)
//! - zone-guard/status - Device status from telemetry (QoS 0)
//! - zone-guard/metrics - Periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    alerts_topic: String,
    positions_topic: String,
    status_topic: String,
    metrics_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("{}-egress-{}", config.mqtt_client_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        // Set credentials if configured
        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        // Spawn the eventloop handler
        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        // QoS 1 acknowledgement received
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            alerts_topic: config.mqtt_egress_alerts_topic().to_string(),
            positions_topic: config.mqtt_egress_positions_topic().to_string(),
            status_topic: config.mqtt_egress_status_topic().to_string(),
            metrics_topic: config.mqtt_egress_metrics_topic().to_string(),
        }
    }

    /// Run the publisher loop
    ///
    /// Processes messages from the channel and publishes to MQTT.
    /// Runs until shutdown signal is received.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            alerts = %self.alerts_topic,
            positions = %self.positions_topic,
            status = %self.status_topic,
            metrics = %self.metrics_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                // Check for shutdown
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        // Drain remaining messages
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                // Process messages
                Some(msg) = self.rx.recv() => {
                    self.publish_message(msg).await;
                }
            }
        }
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, qos: QoS, payload: &T, kind: &str) {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, kind = %kind, "mqtt_egress_serialize_failed");
                return;
            }
        };
        if let Err(e) = self.client.publish(topic, qos, false, json.into_bytes()).await {
            if qos == QoS::AtLeastOnce {
                error!(error = %e, kind = %kind, "mqtt_egress_publish_failed");
            } else {
                debug!(error = %e, kind = %kind, "mqtt_egress_publish_failed");
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::Alert(payload) => {
                // Use QoS 1 for alerts (at-least-once delivery)
                self.publish_json(&self.alerts_topic, QoS::AtLeastOnce, &payload, "alert").await;
            }
            EgressMessage::Position(payload) => {
                self.publish_json(&self.positions_topic, QoS::AtMostOnce, &payload, "position")
                    .await;
            }
            EgressMessage::Status(payload) => {
                self.publish_json(&self.status_topic, QoS::AtMostOnce, &payload, "status").await;
            }
            EgressMessage::Metrics(payload) => {
                self.publish_json(&self.metrics_topic, QoS::AtMostOnce, &payload, "metrics").await;
            }
        }
    }
}
