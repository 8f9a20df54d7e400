//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::services::estimator::EstimatorConfig;
use crate::services::exit_detector::ExitConfig;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier, stamped on egress messages
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "zone-guard".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Network-server uplink topic filter
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic: default_mqtt_topic(),
            client_id: default_mqtt_client_id(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "application/+/device/+/event/up".to_string()
}

fn default_mqtt_client_id() -> String {
    "zone-guard".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON document holding beacons, rooms and devices
    #[serde(default = "default_store_path")]
    pub path: String,
    /// How often the monitor re-reads the store (0 to disable)
    #[serde(default = "default_store_reload_secs")]
    pub reload_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path(), reload_secs: default_store_reload_secs() }
    }
}

fn default_store_path() -> String {
    "data/store.json".to_string()
}

fn default_store_reload_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimationConfig {
    #[serde(default = "default_path_loss_exponent")]
    pub path_loss_exponent: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_convergence_m")]
    pub convergence_m: f64,
    /// Fall back to trilateration when fingerprinting yields nothing
    #[serde(default = "default_true")]
    pub trilateration_fallback: bool,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            path_loss_exponent: default_path_loss_exponent(),
            top_k: default_top_k(),
            max_iterations: default_max_iterations(),
            learning_rate: default_learning_rate(),
            convergence_m: default_convergence_m(),
            trilateration_fallback: true,
        }
    }
}

fn default_path_loss_exponent() -> f64 {
    3.0
}

fn default_top_k() -> usize {
    3
}

fn default_max_iterations() -> usize {
    10
}

fn default_learning_rate() -> f64 {
    0.5
}

fn default_convergence_m() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitSection {
    #[serde(default = "default_margin_m")]
    pub margin_m: f64,
    #[serde(default = "default_door_threshold_dbm")]
    pub door_threshold_dbm: f64,
    #[serde(default = "default_fallback_beacon_count")]
    pub fallback_beacon_count: usize,
    #[serde(default = "default_exit_depth_m")]
    pub exit_depth_m: f64,
    #[serde(default = "default_row_size")]
    pub row_size: usize,
    #[serde(default = "default_spacing_m")]
    pub lateral_spacing_m: f64,
    #[serde(default = "default_spacing_m")]
    pub row_spacing_m: f64,
}

impl Default for ExitSection {
    fn default() -> Self {
        Self {
            margin_m: default_margin_m(),
            door_threshold_dbm: default_door_threshold_dbm(),
            fallback_beacon_count: default_fallback_beacon_count(),
            exit_depth_m: default_exit_depth_m(),
            row_size: default_row_size(),
            lateral_spacing_m: default_spacing_m(),
            row_spacing_m: default_spacing_m(),
        }
    }
}

fn default_margin_m() -> f64 {
    0.5
}

fn default_door_threshold_dbm() -> f64 {
    -80.0
}

fn default_fallback_beacon_count() -> usize {
    2
}

fn default_exit_depth_m() -> f64 {
    1.5
}

fn default_row_size() -> usize {
    5
}

fn default_spacing_m() -> f64 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    /// Default window for one acquisition
    #[serde(default = "default_acquisition_ms")]
    pub timeout_ms: u64,
    /// Hard cap, one reporting cycle plus slack
    #[serde(default = "default_acquisition_ms")]
    pub max_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self { timeout_ms: default_acquisition_ms(), max_timeout_ms: default_acquisition_ms() }
    }
}

fn default_acquisition_ms() -> u64 {
    65_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_auto_dismiss_ms")]
    pub auto_dismiss_ms: u64,
    /// How often pending auto-dismissals are checked
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { auto_dismiss_ms: default_auto_dismiss_ms(), tick_ms: default_tick_ms() }
    }
}

fn default_auto_dismiss_ms() -> u64 {
    5_000
}

fn default_tick_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Device id to room id (e.g., "dev1" = "bedroom")
    #[serde(default)]
    pub assignments: HashMap<String, String>,
    /// Merged feed queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Recent uplink keys remembered for redelivery detection
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            assignments: HashMap::new(),
            queue_capacity: default_queue_capacity(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_dedup_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for alert egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "alerts.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Enable MQTT egress publishing
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Topic for alert changes (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
    /// Topic for position and exit decisions (QoS 0)
    #[serde(default = "default_positions_topic")]
    pub positions_topic: String,
    /// Topic for device status updates (QoS 0)
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    /// Interval for publishing metrics (seconds)
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alerts_topic: default_alerts_topic(),
            positions_topic: default_positions_topic(),
            status_topic: default_status_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

fn default_alerts_topic() -> String {
    "zone-guard/alerts".to_string()
}

fn default_positions_topic() -> String {
    "zone-guard/positions".to_string()
}

fn default_status_topic() -> String {
    "zone-guard/status".to_string()
}

fn default_metrics_topic() -> String {
    "zone-guard/metrics".to_string()
}

fn default_metrics_publish_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub estimation: EstimationConfig,
    #[serde(default)]
    pub exit: ExitSection,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt: MqttConfig,
    store_path: String,
    store_reload_secs: u64,
    estimation: EstimationConfig,
    exit: ExitSection,
    acquisition_timeout_ms: u64,
    acquisition_max_timeout_ms: u64,
    auto_dismiss_ms: u64,
    alert_tick_ms: u64,
    assignments: HashMap<String, String>,
    queue_capacity: usize,
    dedup_capacity: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
    egress_file: String,
    mqtt_egress: MqttEgressConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let acquisition = toml_config.acquisition;
        Self {
            site_id: toml_config.site.id,
            mqtt: toml_config.mqtt,
            store_path: toml_config.store.path,
            store_reload_secs: toml_config.store.reload_secs,
            estimation: toml_config.estimation,
            exit: toml_config.exit,
            // The default window never exceeds the cap
            acquisition_timeout_ms: acquisition.timeout_ms.min(acquisition.max_timeout_ms),
            acquisition_max_timeout_ms: acquisition.max_timeout_ms,
            auto_dismiss_ms: toml_config.alerts.auto_dismiss_ms,
            alert_tick_ms: toml_config.alerts.tick_ms.max(1),
            assignments: toml_config.monitor.assignments,
            queue_capacity: toml_config.monitor.queue_capacity.max(1),
            dedup_capacity: toml_config.monitor.dedup_capacity,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
            egress_file: toml_config.egress.file,
            mqtt_egress: toml_config.mqtt_egress,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        // Default to dev.toml
        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(Self::resolve_config_path(args))
    }

    /// Room a device is assigned to, if any
    pub fn room_for(&self, device_id: &str) -> Option<&str> {
        self.assignments.get(device_id).map(String::as_str)
    }

    pub fn estimator_config(&self) -> EstimatorConfig {
        EstimatorConfig {
            path_loss_exponent: self.estimation.path_loss_exponent,
            top_k: self.estimation.top_k.max(1),
            max_iterations: self.estimation.max_iterations,
            learning_rate: self.estimation.learning_rate,
            convergence_m: self.estimation.convergence_m,
        }
    }

    pub fn exit_config(&self) -> ExitConfig {
        ExitConfig {
            margin_m: self.exit.margin_m,
            door_threshold_dbm: self.exit.door_threshold_dbm,
            fallback_beacon_count: self.exit.fallback_beacon_count,
            exit_depth_m: self.exit.exit_depth_m,
            row_size: self.exit.row_size.max(1),
            lateral_spacing_m: self.exit.lateral_spacing_m,
            row_spacing_m: self.exit.row_spacing_m,
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt.topic
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt.client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn store_path(&self) -> &str {
        &self.store_path
    }

    /// Store re-read period for the monitor; `None` when disabled
    pub fn store_reload_interval(&self) -> Option<Duration> {
        (self.store_reload_secs > 0).then(|| Duration::from_secs(self.store_reload_secs))
    }

    pub fn trilateration_fallback(&self) -> bool {
        self.estimation.trilateration_fallback
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition_timeout_ms)
    }

    pub fn acquisition_max_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition_max_timeout_ms)
    }

    pub fn auto_dismiss(&self) -> Duration {
        Duration::from_millis(self.auto_dismiss_ms)
    }

    pub fn alert_tick(&self) -> Duration {
        Duration::from_millis(self.alert_tick_ms)
    }

    pub fn assignments(&self) -> &HashMap<String, String> {
        &self.assignments
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn dedup_capacity(&self) -> usize {
        self.dedup_capacity
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    // MQTT Egress getters
    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress.enabled
    }

    pub fn mqtt_egress_alerts_topic(&self) -> &str {
        &self.mqtt_egress.alerts_topic
    }

    pub fn mqtt_egress_positions_topic(&self) -> &str {
        &self.mqtt_egress.positions_topic
    }

    pub fn mqtt_egress_status_topic(&self) -> &str {
        &self.mqtt_egress.status_topic
    }

    pub fn mqtt_egress_metrics_topic(&self) -> &str {
        &self.mqtt_egress.metrics_topic
    }

    pub fn mqtt_egress_metrics_interval_secs(&self) -> u64 {
        self.mqtt_egress.metrics_publish_interval_secs
    }

    /// Builder method for tests to assign a device to a room
    pub fn with_assignment(mut self, device_id: &str, room_id: &str) -> Self {
        self.assignments.insert(device_id.to_string(), room_id.to_string());
        self
    }

    /// Builder method for tests to set the store re-read period
    pub fn with_store_reload_secs(mut self, secs: u64) -> Self {
        self.store_reload_secs = secs;
        self
    }

    /// Builder method for tests to set the auto-dismiss delay
    pub fn with_auto_dismiss_ms(mut self, ms: u64) -> Self {
        self.auto_dismiss_ms = ms;
        self
    }

    /// Builder method for tests to redirect the alert history file
    pub fn with_egress_file(mut self, path: &str) -> Self {
        self.egress_file = path.to_string();
        self
    }

    /// Builder method for tests to toggle the trilateration fallback
    pub fn with_trilateration_fallback(mut self, enabled: bool) -> Self {
        self.estimation.trilateration_fallback = enabled;
        self
    }
}
