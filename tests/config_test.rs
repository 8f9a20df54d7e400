//! Integration tests for configuration loading

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use zone_guard::infra::Config;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-site"

[mqtt]
host = "test-host"
port = 1884
topic = "application/7/device/+/event/up"

[store]
path = "/var/lib/zone-guard/store.json"
reload_secs = 10

[estimation]
top_k = 4
path_loss_exponent = 2.5
trilateration_fallback = false

[exit]
margin_m = 0.25
door_threshold_dbm = -75.0
row_size = 3

[acquisition]
timeout_ms = 30000
max_timeout_ms = 65000

[alerts]
auto_dismiss_ms = 8000

[monitor]
assignments = { "dev1" = "bedroom", "dev2" = "kitchen" }
queue_capacity = 64

[metrics]
interval_secs = 15
prometheus_port = 9091

[mqtt_egress]
enabled = false
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_topic(), "application/7/device/+/event/up");
    assert_eq!(config.store_path(), "/var/lib/zone-guard/store.json");
    assert_eq!(config.store_reload_interval(), Some(Duration::from_secs(10)));
    assert!(!config.trilateration_fallback());
    assert_eq!(config.acquisition_timeout(), Duration::from_secs(30));
    assert_eq!(config.auto_dismiss(), Duration::from_secs(8));
    assert_eq!(config.room_for("dev1"), Some("bedroom"));
    assert_eq!(config.room_for("dev3"), None);
    assert_eq!(config.queue_capacity(), 64);
    assert_eq!(config.prometheus_port(), 9091);
    assert!(!config.mqtt_egress_enabled());

    let est = config.estimator_config();
    assert_eq!(est.top_k, 4);
    assert_eq!(est.path_loss_exponent, 2.5);

    let exit = config.exit_config();
    assert_eq!(exit.margin_m, 0.25);
    assert_eq!(exit.door_threshold_dbm, -75.0);
    assert_eq!(exit.row_size, 3);
    // Unset keys keep their defaults
    assert_eq!(exit.exit_depth_m, 1.5);
}

#[test]
fn test_acquisition_timeout_capped() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[acquisition]\ntimeout_ms = 120000\nmax_timeout_ms = 65000").unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.acquisition_timeout(), Duration::from_secs(65));
    assert_eq!(config.acquisition_max_timeout(), Duration::from_secs(65));
}

#[test]
fn test_invalid_toml_is_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[exit\nmargin_m = ").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.auto_dismiss(), Duration::from_secs(5));
    assert!(config.trilateration_fallback());
    assert!(config.assignments().is_empty());
}
