//! Measurement acquisition: one fresh sample from a live device feed
//!
//! The record a subscription is handed on subscribe may be left over from a
//! previous reporting cycle, so it only establishes a baseline timestamp.
//! The acquisition completes at the first record whose timestamp differs.
//! An empty feed has an empty baseline: its first record is already fresh.
//!
//! Each acquisition ends in exactly one of three terminal states: completed,
//! timed out or cancelled. The winner is decided by a single compare-exchange
//! on the shared state, so a late `cancel()` is a no-op and reports `false`.
//! The subscription and the per-device in-flight slot are released on every
//! path before the outcome is delivered.

use crate::domain::error::TrackingError;
use crate::domain::types::{FeedRecord, Measurement};
use crate::infra::metrics::{AcquisitionOutcome, Metrics};
use crate::io::feed_hub::FeedHub;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

/// Upper bound on an acquisition window, one reporting cycle plus slack
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(65);

const STATE_PENDING: u8 = 0;
const STATE_RESOLVED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Baseline {
    /// Taken from the first observed record
    #[default]
    Pending,
    /// The feed had no current value
    Empty,
    At(DateTime<Utc>),
}

/// Baseline-then-transition detector over a record stream
#[derive(Debug, Default)]
pub struct BaselineTracker {
    baseline: Baseline,
}

impl BaselineTracker {
    /// Tracker whose baseline is the first record observed
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker seeded with the feed's current value at subscribe time
    ///
    /// `None` means the feed was empty, so the next record completes.
    pub fn with_baseline(current: Option<DateTime<Utc>>) -> Self {
        let baseline = match current {
            Some(ts) => Baseline::At(ts),
            None => Baseline::Empty,
        };
        Self { baseline }
    }

    pub fn baseline(&self) -> Option<DateTime<Utc>> {
        match self.baseline {
            Baseline::At(ts) => Some(ts),
            Baseline::Pending | Baseline::Empty => None,
        }
    }

    /// Feed one record; returns the measurement once a new sample is seen
    pub fn observe(&mut self, record: &FeedRecord) -> Option<Measurement> {
        match self.baseline {
            Baseline::Pending => {
                self.baseline = Baseline::At(record.timestamp);
                None
            }
            Baseline::At(ts) if ts == record.timestamp => None,
            Baseline::At(_) | Baseline::Empty => Some(record.to_measurement()),
        }
    }
}

/// Cloneable canceller for a running acquisition
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
    wake: Arc<Notify>,
}

impl CancelHandle {
    /// Cancel if still pending; `false` if the acquisition already resolved
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(STATE_PENDING, STATE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.wake.notify_one();
        }
        won
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PENDING
    }
}

/// A running acquisition
#[derive(Debug)]
pub struct Acquisition {
    device_id: String,
    cancel: CancelHandle,
    result_rx: oneshot::Receiver<Result<Measurement, TrackingError>>,
}

impl Acquisition {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the terminal state
    pub async fn outcome(self) -> Result<Measurement, TrackingError> {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => Err(TrackingError::SubscriptionError(
                "acquisition task ended without a result".to_string(),
            )),
        }
    }
}

/// Releases the device's in-flight slot on drop
struct InFlightGuard {
    set: Arc<Mutex<FxHashSet<String>>>,
    device_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.device_id);
    }
}

/// Starts acquisitions against a feed, one in flight per device
#[derive(Clone)]
pub struct Acquirer {
    hub: FeedHub,
    in_flight: Arc<Mutex<FxHashSet<String>>>,
    max_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Acquirer {
    pub fn new(hub: FeedHub, max_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self { hub, in_flight: Arc::new(Mutex::new(FxHashSet::default())), max_timeout, metrics }
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    pub fn is_in_flight(&self, device_id: &str) -> bool {
        self.in_flight.lock().contains(device_id)
    }

    /// Subscribe to the device feed and wait for one fresh sample
    ///
    /// The timeout is clamped to the configured maximum. Must be called from
    /// within a tokio runtime.
    pub fn acquire(&self, device_id: &str, timeout: Duration) -> Result<Acquisition, TrackingError> {
        if !self.in_flight.lock().insert(device_id.to_string()) {
            warn!(device_id = %device_id, "acquisition_in_flight");
            return Err(TrackingError::AcquisitionInFlight { device_id: device_id.to_string() });
        }
        let guard = InFlightGuard { set: self.in_flight.clone(), device_id: device_id.to_string() };

        let timeout = timeout.min(self.max_timeout);
        let mut sub = self.hub.subscribe(device_id);

        let state = Arc::new(AtomicU8::new(STATE_PENDING));
        let wake = Arc::new(Notify::new());
        let cancel = CancelHandle { state: state.clone(), wake: wake.clone() };
        let (mut result_tx, result_rx) = oneshot::channel();

        info!(device_id = %device_id, timeout_ms = timeout.as_millis() as u64, "acquisition_started");

        let metrics = self.metrics.clone();
        let id = device_id.to_string();
        tokio::spawn(async move {
            let mut tracker = BaselineTracker::with_baseline(sub.replayed());
            let sleep = tokio::time::sleep(timeout);
            tokio::pin!(sleep);

            let result = loop {
                tokio::select! {
                    biased;
                    _ = wake.notified() => {
                        break Err(TrackingError::AcquisitionCancelled { device_id: id.clone() });
                    }
                    // Handle dropped without cancelling
                    _ = result_tx.closed() => {
                        state.store(STATE_CANCELLED, Ordering::Release);
                        break Err(TrackingError::AcquisitionCancelled { device_id: id.clone() });
                    }
                    _ = &mut sleep => {
                        break Err(TrackingError::MeasurementTimeout {
                            device_id: id.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    record = sub.recv() => match record {
                        Some(record) => {
                            if let Some(measurement) = tracker.observe(&record) {
                                break Ok(measurement);
                            }
                            debug!(device_id = %id, timestamp = %record.timestamp, "acquisition_stale_record");
                        }
                        None => {
                            break Err(TrackingError::SubscriptionError("device feed closed".to_string()));
                        }
                    }
                }
            };

            sub.close();

            // A cancel that raced a completion or timeout wins only if it got there first
            let result = match result {
                Err(TrackingError::AcquisitionCancelled { .. }) => result,
                other => {
                    let claimed = state
                        .compare_exchange(
                            STATE_PENDING,
                            STATE_RESOLVED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    if claimed {
                        other
                    } else {
                        Err(TrackingError::AcquisitionCancelled { device_id: id.clone() })
                    }
                }
            };

            drop(guard);

            let outcome = match &result {
                Ok(m) => {
                    info!(device_id = %id, readings = m.readings.len(), timestamp = %m.timestamp, "measurement_acquired");
                    AcquisitionOutcome::Completed
                }
                Err(TrackingError::MeasurementTimeout { timeout_ms, .. }) => {
                    warn!(device_id = %id, timeout_ms = *timeout_ms, "measurement_timeout");
                    AcquisitionOutcome::TimedOut
                }
                Err(TrackingError::AcquisitionCancelled { .. }) => {
                    info!(device_id = %id, "acquisition_cancelled");
                    AcquisitionOutcome::Cancelled
                }
                Err(e) => {
                    warn!(device_id = %id, error = %e, "acquisition_failed");
                    AcquisitionOutcome::Failed
                }
            };
            metrics.record_acquisition(outcome);

            let _ = result_tx.send(result);
        });

        Ok(Acquisition { device_id: device_id.to_string(), cancel, result_rx })
    }
}
