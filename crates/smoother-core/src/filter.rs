//! Constant-velocity Kalman filter over an account balance
//!
//! State-space model:
//! - State: `x = [balance, velocity]` (velocity in currency units per day)
//! - Transition: `A = [[1, dt], [0, 1]]`
//! - Observation: `H = [[1, 0]]` (only the balance is observed)
//! - Process noise: `Q = I · q_scale`
//! - Measurement noise: `R = [[r_scale]]`
//!
//! Both noise scales grow with the transaction magnitude: large transactions
//! permit faster drift of the hidden state and are trusted less as point
//! observations. The coefficients live in [`NoiseModel`] so they can be tuned
//! from configuration.
//!
//! Everything here is pure: no I/O, no clock, no logging.

use crate::error::{Error, Result};

/// `[balance, velocity]`
pub type Vector2 = [f64; 2];

/// Row-major 2×2 matrix
pub type Matrix2 = [[f64; 2]; 2];

pub const IDENTITY: Matrix2 = [[1.0, 0.0], [0.0, 1.0]];

/// Lower bound on the measurement noise actually used in an update, whatever
/// the configuration says. Keeps the innovation variance invertible.
pub const MIN_MEASUREMENT_NOISE: f64 = 1e-9;

/// Posterior (or predicted) Gaussian over `[balance, velocity]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub mean: Vector2,
    pub covariance: Matrix2,
}

impl Estimate {
    /// Near-total uncertainty centred on zero, so the first observation
    /// dominates the posterior.
    pub fn diffuse(prior_variance: f64) -> Self {
        Self {
            mean: [0.0, 0.0],
            covariance: [[prior_variance, 0.0], [0.0, prior_variance]],
        }
    }

    /// Smoothed balance
    pub fn balance(&self) -> f64 {
        self.mean[0]
    }

    /// Estimated drift per day
    pub fn velocity(&self) -> f64 {
        self.mean[1]
    }

    /// Variance of the balance estimate
    pub fn variance(&self) -> f64 {
        self.covariance[0][0]
    }

    /// Describe why this estimate can no longer be trusted, if it can't.
    ///
    /// Checks that every component is finite and that the covariance is
    /// symmetric and positive semi-definite within `tolerance` (relative to
    /// the magnitude of the entries).
    pub fn degeneracy(&self, tolerance: f64) -> Option<String> {
        let [[p00, p01], [p10, p11]] = self.covariance;

        if !self.mean.iter().all(|v| v.is_finite()) {
            return Some(format!("non-finite mean {:?}", self.mean));
        }
        if ![p00, p01, p10, p11].iter().all(|v| v.is_finite()) {
            return Some(format!("non-finite covariance {:?}", self.covariance));
        }

        let scale = p00.abs().max(p11.abs()).max(1.0);
        if (p01 - p10).abs() > tolerance * scale {
            return Some(format!("asymmetric covariance (p01={p01}, p10={p10})"));
        }
        if p00 < -tolerance * scale || p11 < -tolerance * scale {
            return Some(format!("negative variance (p00={p00}, p11={p11})"));
        }
        let det = p00 * p11 - p01 * p10;
        if det < -tolerance * scale * scale {
            return Some(format!("covariance not positive semi-definite (det={det})"));
        }

        None
    }

    /// [`degeneracy`](Self::degeneracy) as an error
    pub fn check(&self, tolerance: f64) -> Result<()> {
        match self.degeneracy(tolerance) {
            Some(reason) => Err(Error::NumericalDegeneracy(reason)),
            None => Ok(()),
        }
    }
}

/// Heuristic noise scaling as a function of transaction magnitude
///
/// `q_scale = max(process_floor, process_per_unit·|amount| + process_base)`
/// `r_scale = max(measurement_floor, measurement_per_unit·|amount| + measurement_base)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseModel {
    pub process_base: f64,
    pub process_per_unit: f64,
    pub process_floor: f64,
    pub measurement_base: f64,
    pub measurement_per_unit: f64,
    pub measurement_floor: f64,
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self {
            process_base: 1.0,
            process_per_unit: 0.1,
            process_floor: 1.0,
            measurement_base: 1.0,
            measurement_per_unit: 0.5,
            measurement_floor: 1.0,
        }
    }
}

impl NoiseModel {
    pub fn process_scale(&self, magnitude: f64) -> f64 {
        (self.process_per_unit * magnitude.abs() + self.process_base).max(self.process_floor)
    }

    pub fn measurement_scale(&self, magnitude: f64) -> f64 {
        (self.measurement_per_unit * magnitude.abs() + self.measurement_base)
            .max(self.measurement_floor)
            .max(MIN_MEASUREMENT_NOISE)
    }
}

/// Propagate an estimate forward by `dt` days.
///
/// `meanPred = A·mean`, `covPred = A·P·Aᵀ + I·q_scale`
pub fn predict(prior: &Estimate, dt: f64, q_scale: f64) -> Estimate {
    let transition = [[1.0, dt], [0.0, 1.0]];
    let [m0, m1] = prior.mean;

    let propagated = mul(&mul(&transition, &prior.covariance), &transpose(&transition));

    Estimate {
        mean: [m0 + dt * m1, m1],
        covariance: add(&propagated, &scale(&IDENTITY, q_scale)),
    }
}

/// Fold a balance observation `z` into a predicted estimate.
///
/// With `H = [1, 0]` the innovation variance is the scalar
/// `S = P00 + r` and the gain is the first column of `P` divided by `S`.
pub fn update(predicted: &Estimate, z: f64, r_scale: f64) -> Estimate {
    let r = r_scale.max(MIN_MEASUREMENT_NOISE);
    let p = predicted.covariance;

    let s = p[0][0] + r;
    let gain = [p[0][0] / s, p[1][0] / s];
    let residual = z - predicted.mean[0];

    let mean = [
        predicted.mean[0] + gain[0] * residual,
        predicted.mean[1] + gain[1] * residual,
    ];

    // (I - K·H)
    let correction = [[1.0 - gain[0], 0.0], [-gain[1], 1.0]];
    let covariance = symmetrize(&mul(&correction, &p));

    Estimate { mean, covariance }
}

/// One full predict/update cycle for an observation `z` taken `dt` days
/// after `prior`, for a transaction of the given magnitude.
pub fn step(prior: &Estimate, z: f64, dt: f64, magnitude: f64, noise: &NoiseModel) -> Estimate {
    let predicted = predict(prior, dt, noise.process_scale(magnitude));
    update(&predicted, z, noise.measurement_scale(magnitude))
}

fn mul(a: &Matrix2, b: &Matrix2) -> Matrix2 {
    let mut out = [[0.0; 2]; 2];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = a[i][0] * b[0][j] + a[i][1] * b[1][j];
        }
    }
    out
}

fn transpose(a: &Matrix2) -> Matrix2 {
    [[a[0][0], a[1][0]], [a[0][1], a[1][1]]]
}

fn add(a: &Matrix2, b: &Matrix2) -> Matrix2 {
    [
        [a[0][0] + b[0][0], a[0][1] + b[0][1]],
        [a[1][0] + b[1][0], a[1][1] + b[1][1]],
    ]
}

fn scale(a: &Matrix2, k: f64) -> Matrix2 {
    [[a[0][0] * k, a[0][1] * k], [a[1][0] * k, a[1][1] * k]]
}

fn symmetrize(a: &Matrix2) -> Matrix2 {
    let off = 0.5 * (a[0][1] + a[1][0]);
    [[a[0][0], off], [off, a[1][1]]]
}
