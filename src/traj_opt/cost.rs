//! Quadratic cost approximations
use super::forward::{forward, Marginals};
use crate::algorithm::TrajectoryInfo;
use crate::error::{check_shape, TrajOptError};
use crate::policy::LinearGaussianPolicy;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

/// Per-time-step quadratic cost `½ zᵀ Cm_t z + cv_tᵀ z` over the joint vector `z`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadraticCost {
    /// Shape `(T, D, D)`.
    pub cm: Array3<f64>,
    /// Shape `(T, D)`.
    pub cv: Array2<f64>,
}

impl QuadraticCost {
    pub fn new(cm: Array3<f64>, cv: Array2<f64>) -> Result<Self, TrajOptError> {
        let (horizon, d, _) = cm.dim();
        check_shape("cm", &[horizon, d, d], cm.shape())?;
        check_shape("cv", &[horizon, d], cv.shape())?;
        Ok(Self { cm, cv })
    }

    pub fn horizon(&self) -> usize {
        self.cm.dim().0
    }

    /// Joint dimension `D`.
    pub fn dz(&self) -> usize {
        self.cm.dim().1
    }

    pub fn cm_at(&self, t: usize) -> ArrayView2<f64> {
        self.cm.index_axis(Axis(0), t)
    }

    pub fn cv_at(&self, t: usize) -> ArrayView1<f64> {
        self.cv.index_axis(Axis(0), t)
    }
}

/// Expected cost per time step of a controller under the local cost approximation.
///
/// Laplace approximation: `cc_t + ½ tr(Σ_t Cm_t) + ½ μ_tᵀ Cm_t μ_t + μ_tᵀ cv_t`
/// with `(μ_t, Σ_t)` the forward-pass marginals of `policy`.
pub fn estimate_cost(
    policy: &LinearGaussianPolicy,
    traj_info: &TrajectoryInfo,
) -> Result<Array1<f64>, TrajOptError> {
    let marginals = forward(policy, traj_info)?;
    let horizon = policy.horizon();
    let d = marginals.dz();
    check_shape("cm", &[horizon, d, d], traj_info.cm.shape())?;
    check_shape("cv", &[horizon, d], traj_info.cv.shape())?;
    check_shape("cc", &[horizon], traj_info.cc.shape())?;
    Ok(laplace_cost(&marginals, traj_info))
}

fn laplace_cost(marginals: &Marginals, traj_info: &TrajectoryInfo) -> Array1<f64> {
    Array1::from_shape_fn(marginals.horizon(), |t| {
        let mu = marginals.mu_at(t);
        let sigma = marginals.sigma_at(t);
        let cm = traj_info.cm.index_axis(Axis(0), t);
        let cv = traj_info.cv.index_axis(Axis(0), t);
        traj_info.cc[t]
            + 0.5 * (&sigma * &cm).sum()
            + 0.5 * mu.dot(&cm.dot(&mu))
            + mu.dot(&cv)
    })
}
