//! The KL dual variable
use super::config::ConstraintMode;
use crate::error::TrajOptError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Lagrange multiplier of the KL trust region.
///
/// Holds one value for a whole-trajectory constraint or one value per time step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eta(Array1<f64>);

impl Eta {
    /// A single multiplier.
    pub fn scalar(value: f64) -> Self {
        Self(Array1::from_elem(1, value))
    }

    /// One multiplier per time step.
    pub fn per_step(values: Array1<f64>) -> Self {
        Self(values)
    }

    /// Reshape for a constraint mode and horizon.
    ///
    /// A single value is broadcast to every time step in [`ConstraintMode::PerStep`].
    ///
    /// # Errors
    /// [`TrajOptError::EtaLength`] if the length fits neither the mode nor the horizon.
    pub fn for_mode(&self, mode: ConstraintMode, horizon: usize) -> Result<Self, TrajOptError> {
        let len = self.0.len();
        match mode {
            ConstraintMode::PerTrajectory if len == 1 => Ok(self.clone()),
            ConstraintMode::PerStep if len == horizon => Ok(self.clone()),
            ConstraintMode::PerStep if len == 1 => {
                Ok(Self(Array1::from_elem(horizon, self.0[0])))
            }
            _ => Err(TrajOptError::EtaLength {
                actual: len,
                horizon,
            }),
        }
    }

    /// Multiplier that applies at time step `t`.
    pub fn at(&self, t: usize) -> f64 {
        if self.0.len() == 1 {
            self.0[0]
        } else {
            self.0[t]
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub const fn values(&self) -> &Array1<f64> {
        &self.0
    }

    pub(crate) fn values_mut(&mut self) -> &mut Array1<f64> {
        &mut self.0
    }

    /// Mean over the time steps that carry a constraint.
    ///
    /// The last time step is excluded for per-step multipliers.
    pub fn mean(&self) -> f64 {
        let n = self.0.len();
        if n <= 1 {
            self.0.iter().sum()
        } else {
            self.0.slice(ndarray::s![..n - 1]).mean().unwrap_or(f64::NAN)
        }
    }
}

impl From<f64> for Eta {
    fn from(value: f64) -> Self {
        Self::scalar(value)
    }
}

/// Bisection bracket on each component of eta.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EtaBracket {
    lower: Array1<f64>,
    upper: Array1<f64>,
    max_eta: f64,
}

impl EtaBracket {
    pub fn new(len: usize, min_eta: f64, max_eta: f64) -> Self {
        Self {
            lower: Array1::from_elem(len, min_eta),
            upper: Array1::from_elem(len, max_eta),
            max_eta,
        }
    }

    pub fn lower(&self) -> &Array1<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &Array1<f64> {
        &self.upper
    }

    /// Shrink the bracket using the constraint violation at `eta` and pick the next eta.
    ///
    /// A negative violation means eta was too large. The update is geometric bisection,
    /// limited to a factor of 10 per step.
    pub fn update(&mut self, eta: &mut Eta, con: &Array1<f64>) {
        let values = eta.values_mut();
        for i in 0..values.len() {
            let current = values[i];
            if con[i] < 0.0 {
                self.upper[i] = current;
                if self.lower[i] > self.upper[i] {
                    self.lower[i] = self.upper[i];
                }
                let geom = (self.lower[i] * self.upper[i]).sqrt();
                values[i] = geom.max(0.1 * self.upper[i]);
            } else {
                self.lower[i] = current;
                if self.lower[i] > self.upper[i] {
                    // Regularization pushed eta past the bracket.
                    self.upper[i] = self.max_eta.max(current);
                }
                let geom = (self.lower[i] * self.upper[i]).sqrt();
                values[i] = geom.min(10.0 * self.lower[i]);
            }
            debug_assert!(self.lower[i] <= self.upper[i]);
        }
    }
}
