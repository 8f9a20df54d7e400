//! Position estimation from signal-strength snapshots
//!
//! Two methods:
//! - Fingerprinting (primary): compare the live snapshot with the latest
//!   measurement of every calibration point, average the best matches.
//! - Trilateration (fallback): convert RSSI to distance with the log-distance
//!   path loss model and refine a position against >= 3 fixed beacons.
//!
//! The hybrid selector prefers fingerprinting and only falls back when it
//! produces nothing. `None` means "no update this cycle", never an error.

use crate::domain::error::TrackingError;
use crate::domain::types::{
    Beacon, CalibrationPoint, CoordSpace, EstimateMethod, Point, PositionEstimate, Snapshot,
};
use tracing::{debug, trace};

/// Reference RSSI at 1 meter (dBm)
pub const DEFAULT_REFERENCE_RSSI: f64 = -59.0;

/// Path loss exponent for indoor propagation
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 3.0;

/// Minimum number of fixed beacons for trilateration
const MIN_TRILATERATION_BEACONS: usize = 3;

/// Signal range mapped onto the strength part of trilateration confidence (dBm)
const STRENGTH_FLOOR_DBM: f64 = -100.0;
const STRENGTH_CEIL_DBM: f64 = -40.0;

/// Residual error mapped onto the consistency part of trilateration confidence (m)
const MAX_RESIDUAL_M: f64 = 5.0;

/// Convert RSSI to distance in meters with the log-distance path loss model
///
/// `d = 10^((ref - rssi) / (10 n))`. Returns `None` for `rssi == 0`, which
/// devices report when no signal was measured.
pub fn rssi_to_distance(rssi: f64, reference_rssi: f64, path_loss_exponent: f64) -> Option<f64> {
    if rssi == 0.0 {
        return None;
    }
    Some(10f64.powf((reference_rssi - rssi) / (10.0 * path_loss_exponent)))
}

/// Similarity between a live snapshot and a stored measurement
///
/// `1 / (1 + rmse)` over the addresses present in both; 0 when nothing is shared.
pub fn similarity(snapshot: &Snapshot, stored: &Snapshot) -> f64 {
    let (sum_sq, shared) = snapshot
        .iter()
        .filter_map(|(addr, rssi)| stored.get(addr).map(|s| (rssi - s).powi(2)))
        .fold((0.0, 0usize), |(sum, n), sq| (sum + sq, n + 1));

    if shared == 0 {
        return 0.0;
    }
    let rmse = (sum_sq / shared as f64).sqrt();
    1.0 / (1.0 + rmse)
}

/// Tunables for both estimation methods
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    /// Path loss exponent `n`
    pub path_loss_exponent: f64,
    /// Number of best-matching calibration points averaged
    pub top_k: usize,
    /// Trilateration refinement cap
    pub max_iterations: usize,
    /// Step scale applied to the averaged gradient
    pub learning_rate: f64,
    /// Stop refining once a step moves less than this (meters)
    pub convergence_m: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            top_k: 3,
            max_iterations: 10,
            learning_rate: 0.5,
            convergence_m: 0.01,
        }
    }
}

/// A fixed beacon paired with its measured distance
#[derive(Debug, Clone, Copy)]
struct Anchor {
    position: Point,
    distance: f64,
    rssi: f64,
}

/// Hybrid fingerprint / trilateration estimator
#[derive(Debug, Clone, Default)]
pub struct PositionEstimator {
    config: EstimatorConfig,
}

impl PositionEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Hybrid selection: fingerprint first, trilateration only as fallback
    pub fn estimate(
        &self,
        snapshot: &Snapshot,
        points: &[CalibrationPoint],
        fixed_beacons: &[Beacon],
    ) -> Option<PositionEstimate> {
        match self.fingerprint_checked(snapshot, points) {
            Ok(estimate) => return Some(estimate),
            Err(e) => debug!(reason = %e, "fingerprint_unavailable"),
        }

        match self.trilaterate_checked(snapshot, fixed_beacons) {
            Ok(estimate) => Some(estimate),
            Err(e) => {
                debug!(reason = %e, "trilateration_unavailable");
                None
            }
        }
    }

    pub fn fingerprint(
        &self,
        snapshot: &Snapshot,
        points: &[CalibrationPoint],
    ) -> Option<PositionEstimate> {
        self.fingerprint_checked(snapshot, points).ok()
    }

    /// Fingerprint estimate with the failure reason kept
    pub fn fingerprint_checked(
        &self,
        snapshot: &Snapshot,
        points: &[CalibrationPoint],
    ) -> Result<PositionEstimate, TrackingError> {
        if points.is_empty() {
            return Err(TrackingError::InsufficientCalibrationData);
        }

        // An identical stored snapshot (same addresses, same values) pins
        // the estimate to that point
        let identical = points.iter().find(|p| {
            !snapshot.is_empty() && p.latest_measurement().is_some_and(|m| m.readings == *snapshot)
        });
        if let Some(point) = identical {
            return Ok(PositionEstimate {
                position: point.position,
                confidence: 1.0,
                method: EstimateMethod::Fingerprint,
                space: CoordSpace::Normalized,
            });
        }

        let mut ranked: Vec<(f64, Point)> = points
            .iter()
            .map(|p| {
                let sim = p.latest_measurement().map_or(0.0, |m| similarity(snapshot, &m.readings));
                (sim, p.position)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let top_sim = ranked[0].0;
        if top_sim <= 0.0 {
            return Err(TrackingError::InsufficientCalibrationData);
        }

        let k = self.config.top_k.min(ranked.len()).max(1);
        let (mut wx, mut wy, mut total) = (0.0, 0.0, 0.0);
        for (sim, pos) in &ranked[..k] {
            wx += sim * pos.x;
            wy += sim * pos.y;
            total += sim;
        }

        trace!(k = %k, top_sim = %top_sim, total_weight = %total, "fingerprint_ranked");

        Ok(PositionEstimate {
            position: Point::new(wx / total, wy / total),
            confidence: top_sim,
            method: EstimateMethod::Fingerprint,
            space: CoordSpace::Normalized,
        })
    }

    pub fn trilaterate(
        &self,
        snapshot: &Snapshot,
        fixed_beacons: &[Beacon],
    ) -> Option<PositionEstimate> {
        self.trilaterate_checked(snapshot, fixed_beacons).ok()
    }

    /// Trilateration estimate in beacon (meter) space
    pub fn trilaterate_checked(
        &self,
        snapshot: &Snapshot,
        fixed_beacons: &[Beacon],
    ) -> Result<PositionEstimate, TrackingError> {
        let anchors: Vec<Anchor> = fixed_beacons
            .iter()
            .filter_map(|b| {
                let position = b.position?;
                let rssi = *snapshot.get(&b.address)?;
                let distance =
                    rssi_to_distance(rssi, b.tx_power, self.config.path_loss_exponent)?;
                Some(Anchor { position, distance, rssi })
            })
            .collect();

        if anchors.len() < MIN_TRILATERATION_BEACONS {
            return Err(TrackingError::InsufficientBeacons {
                usable: anchors.len(),
                required: MIN_TRILATERATION_BEACONS,
            });
        }

        // Seed at the centroid of the first three anchors
        let seed = &anchors[..MIN_TRILATERATION_BEACONS];
        let mut est = Point::new(
            seed.iter().map(|a| a.position.x).sum::<f64>() / seed.len() as f64,
            seed.iter().map(|a| a.position.y).sum::<f64>() / seed.len() as f64,
        );

        let mut iterations = 0;
        for _ in 0..self.config.max_iterations {
            iterations += 1;
            let (mut gx, mut gy, mut weight_sum) = (0.0, 0.0, 0.0);
            for anchor in &anchors {
                let dx = est.x - anchor.position.x;
                let dy = est.y - anchor.position.y;
                let current = (dx * dx + dy * dy).sqrt();
                if current < f64::EPSILON {
                    continue;
                }
                let error = current - anchor.distance;
                let weight = 1.0 / anchor.distance.max(f64::EPSILON);
                gx += weight * error * dx / current;
                gy += weight * error * dy / current;
                weight_sum += weight;
            }
            if weight_sum <= 0.0 {
                break;
            }

            let step = Point::new(
                self.config.learning_rate * gx / weight_sum,
                self.config.learning_rate * gy / weight_sum,
            );
            est = Point::new(est.x - step.x, est.y - step.y);

            if (step.x * step.x + step.y * step.y).sqrt() < self.config.convergence_m {
                break;
            }
        }

        let confidence = trilateration_confidence(&anchors, est);
        debug!(
            x = %est.x,
            y = %est.y,
            anchors = %anchors.len(),
            iterations = %iterations,
            confidence = %confidence,
            "trilateration_converged"
        );

        Ok(PositionEstimate {
            position: est,
            confidence,
            method: EstimateMethod::Trilateration,
            space: CoordSpace::Meters,
        })
    }
}

/// Blend of signal strength (0.3), beacon count (0.3) and geometric consistency (0.4)
fn trilateration_confidence(anchors: &[Anchor], est: Point) -> f64 {
    let n = anchors.len() as f64;

    let avg_rssi = anchors.iter().map(|a| a.rssi).sum::<f64>() / n;
    let strength = ((avg_rssi - STRENGTH_FLOOR_DBM) / (STRENGTH_CEIL_DBM - STRENGTH_FLOOR_DBM))
        .clamp(0.0, 1.0);

    let count = (n / MIN_TRILATERATION_BEACONS as f64).min(1.0);

    let residual =
        anchors.iter().map(|a| (est.distance_to(&a.position) - a.distance).abs()).sum::<f64>() / n;
    let consistency = 1.0 - (residual / MAX_RESIDUAL_M).clamp(0.0, 1.0);

    0.3 * strength + 0.3 * count + 0.4 * consistency
}
