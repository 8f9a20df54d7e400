//! Alert history egress - appends alert changes to file
//!
//! Each raise, dismissal and expiry is written in JSONL format
//! (one JSON object per line) to the file specified in config.

use crate::io::egress_channel::AlertPayload;
use crate::services::alerts::AlertChange;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Egress writer for alert history
pub struct Egress {
    file_path: String,
}

impl Egress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write an alert change to the egress file
    /// Returns true if successful, false otherwise
    pub fn write_alert_change(&self, change: &AlertChange) -> bool {
        let alert = change.alert();
        let json = match serde_json::to_string(&AlertPayload::from_change(change)) {
            Ok(json) => json,
            Err(e) => {
                error!(alert_id = %alert.id, error = %e, "alert_egress_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                info!(
                    alert_id = %alert.id,
                    device = %alert.device_id,
                    change = %change.as_str(),
                    "alert_egressed"
                );
                true
            }
            Err(e) => {
                error!(alert_id = %alert.id, error = %e, "alert_egress_failed");
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alert::{Alert, AlertType};
    use std::fs;
    use tempfile::tempdir;

    fn exit_alert() -> Alert {
        Alert::new("dev1", AlertType::ZoneExit, "Tag dev1 left the room")
    }

    #[test]
    fn test_write_alert_change() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("alerts.jsonl");
        let egress = Egress::new(file_path.to_str().unwrap());

        assert!(egress.write_alert_change(&AlertChange::Raised(exit_alert())));

        let content = fs::read_to_string(&file_path).unwrap();
        assert!(content.ends_with('\n'));

        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["t"], "raised");
        assert_eq!(parsed["alert"]["id"], "zone_exit:dev1");
        assert_eq!(parsed["alert"]["device_id"], "dev1");
    }

    #[test]
    fn test_appends_lifecycle() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("nested").join("alerts.jsonl");
        fs::create_dir_all(file_path.parent().unwrap()).unwrap();
        fs::write(&file_path, "{\"existing\":\"data\"}\n").unwrap();

        let egress = Egress::new(file_path.to_str().unwrap());
        let mut alert = exit_alert();
        egress.write_alert_change(&AlertChange::Raised(alert.clone()));
        alert.dismissed = true;
        egress.write_alert_change(&AlertChange::Expired(alert));

        let content = fs::read_to_string(&file_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("existing"));
        assert!(lines[2].contains("\"expired\""));
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let nested_path = dir.path().join("a").join("b").join("alerts.jsonl");
        let egress = Egress::new(nested_path.to_str().unwrap());

        assert!(egress.write_alert_change(&AlertChange::Dismissed(exit_alert())));
        assert!(nested_path.exists());
    }
}
