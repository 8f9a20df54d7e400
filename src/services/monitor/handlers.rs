//! Per-record handlers for the Monitor

use super::{DeviceState, Monitor, TrackedPosition};
use crate::domain::alert::{AlertId, AlertType};
use crate::domain::types::{ExitDecision, FeedRecord, Snapshot};
use crate::io::egress_channel::{PositionPayload, StatusPayload};
use std::time::Instant;
use tracing::{debug, info, warn};

impl Monitor {
    fn device_name(&self, device_id: &str) -> String {
        self.doc.device(device_id).map_or_else(|| device_id.to_string(), |d| d.name.clone())
    }

    /// Update device status and raise shock / SOS alerts from event flags
    pub(crate) fn handle_status(&mut self, record: &FeedRecord, now: Instant) {
        let events = record.events;
        if events.shock || events.sos {
            let name = self.device_name(&record.device_id);
            if events.shock {
                self.alerts.raise(
                    &record.device_id,
                    AlertType::Shock,
                    &format!("Shock detected on {}", name),
                    now,
                );
            }
            if events.sos {
                self.alerts.raise(
                    &record.device_id,
                    AlertType::Sos,
                    &format!("SOS button pressed on {}", name),
                    now,
                );
            }
        }

        self.devices.insert(
            record.device_id.clone(),
            DeviceState {
                last_seen: record.timestamp,
                battery_pct: record.battery_pct,
                motion: events.motion_detected(),
                last_event: events.primary(),
                events,
            },
        );

        if let Some(ref sender) = self.egress_sender {
            sender.send_status(StatusPayload::from_record(record));
        }
    }

    /// Estimate, decide and update the exit roster for one record
    pub(crate) fn handle_position(
        &mut self,
        record: &FeedRecord,
        snapshot: &Snapshot,
        now: Instant,
    ) -> Option<ExitDecision> {
        let device_id = record.device_id.as_str();
        let Some(room_id) = self.config.room_for(device_id) else {
            debug!(device_id = %device_id, "device_not_assigned");
            return None;
        };
        let Some(state) = self.rooms.get_mut(room_id) else {
            warn!(device_id = %device_id, room_id = %room_id, "room_not_found");
            return None;
        };

        let fixed =
            if self.config.trilateration_fallback() { &state.fixed_beacons[..] } else { &[] };
        let started = Instant::now();
        let estimate = self.estimator.estimate(snapshot, &state.room.calibration_points, fixed);
        if let Some(ref est) = estimate {
            self.metrics.record_estimate(est.method, started.elapsed().as_micros() as u64);
        }

        let Some(decision) =
            self.detector.decide(device_id, estimate.as_ref(), &state.view(), snapshot, &state.roster)
        else {
            self.metrics.record_cycle_skipped();
            debug!(device_id = %device_id, readings = %snapshot.len(), "cycle_skipped");
            return None;
        };

        if !decision.is_inside {
            if state.roster.insert(device_id) {
                self.metrics.record_exit();
                info!(
                    device_id = %device_id,
                    room_id = %state.room.id,
                    reason = %decision.reason.as_str(),
                    slot = %state.roster.slot_for(device_id),
                    "exit_detected"
                );
                let name =
                    self.doc.device(device_id).map_or(device_id, |d| d.name.as_str()).to_string();
                self.alerts.raise(
                    device_id,
                    AlertType::ZoneExit,
                    &format!("{} left {}", name, state.room.name),
                    now,
                );
            }
        } else if state.roster.remove(device_id) {
            self.metrics.record_reentry();
            info!(device_id = %device_id, room_id = %state.room.id, "device_reentered");
            self.alerts.dismiss(&AlertId::for_condition(device_id, AlertType::ZoneExit));
        }

        if let Some(ref sender) = self.egress_sender {
            sender.send_position(PositionPayload::new(
                device_id,
                &state.room.id,
                estimate.as_ref(),
                &decision,
            ));
        }

        self.positions.insert(
            device_id.to_string(),
            TrackedPosition {
                room_id: state.room.id.clone(),
                estimate,
                decision,
                sampled_at: record.timestamp,
            },
        );

        Some(decision)
    }
}
