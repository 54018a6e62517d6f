//! Locally linear-Gaussian dynamics
use crate::error::{check_shape, TrajOptError};
use crate::linalg;
use crate::policy::LinearGaussianPolicy;
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Time-varying linear-Gaussian dynamics `x_{t+1} ~ N(Fm_t z_t + fv_t, dyn_covar_t)`.
///
/// `z_t` is the joint state-action vector. It is `[x; u]` for a single agent and
/// `[x; u; v]` for a protagonist / adversary game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearDynamics {
    /// Shape `(T, dX, D)`.
    fm: Array3<f64>,
    /// Shape `(T, dX)`.
    fv: Array2<f64>,
    /// Shape `(T, dX, dX)`.
    dyn_covar: Array3<f64>,
}

impl LinearDynamics {
    pub fn new(
        fm: Array3<f64>,
        fv: Array2<f64>,
        dyn_covar: Array3<f64>,
    ) -> Result<Self, TrajOptError> {
        let (horizon, dx, d) = fm.dim();
        if d < dx {
            return Err(TrajOptError::shape("fm", &[horizon, dx, dx], fm.shape()));
        }
        check_shape("fv", &[horizon, dx], fv.shape())?;
        check_shape("dyn_covar", &[horizon, dx, dx], dyn_covar.shape())?;
        Ok(Self { fm, fv, dyn_covar })
    }

    pub fn horizon(&self) -> usize {
        self.fm.dim().0
    }

    pub fn dx(&self) -> usize {
        self.fm.dim().1
    }

    /// Joint state-action dimension `D`.
    pub fn dz(&self) -> usize {
        self.fm.dim().2
    }

    pub const fn fm(&self) -> &Array3<f64> {
        &self.fm
    }

    pub const fn fv(&self) -> &Array2<f64> {
        &self.fv
    }

    pub const fn dyn_covar(&self) -> &Array3<f64> {
        &self.dyn_covar
    }

    pub fn fm_at(&self, t: usize) -> ArrayView2<f64> {
        self.fm.index_axis(Axis(0), t)
    }

    pub fn fv_at(&self, t: usize) -> ArrayView1<f64> {
        self.fv.index_axis(Axis(0), t)
    }

    pub fn dyn_covar_at(&self, t: usize) -> ArrayView2<f64> {
        self.dyn_covar.index_axis(Axis(0), t)
    }

    /// Whether any coefficient is NaN.
    pub fn has_nan(&self) -> bool {
        linalg::has_nan(&self.fm) || linalg::has_nan(&self.fv) || linalg::has_nan(&self.dyn_covar)
    }

    /// Dynamics over `[x; own action]` with a fixed opponent policy substituted in.
    ///
    /// With `Fo` the columns of `Fm` belonging to the opponent and `(G, g, Σ)` its policy:
    /// `F' = [Fx + Fo G | F_own]`, `f' = fv + Fo g` and `cov' = cov + Fo Σ Foᵀ`.
    ///
    /// `own` and `opponent` are column ranges of the joint vector; both must lie after the
    /// `dX` state columns.
    pub fn fold_opponent(
        &self,
        own: Range<usize>,
        opponent: Range<usize>,
        policy: &LinearGaussianPolicy,
    ) -> Result<Self, TrajOptError> {
        let (horizon, dx, _) = self.fm.dim();
        check_shape(
            "opponent gains",
            &[horizon, opponent.len(), dx],
            policy.gains().shape(),
        )?;
        let d_own = own.len();
        let mut fm = Array3::zeros((horizon, dx, dx + d_own));
        let mut fv = self.fv.clone();
        let mut dyn_covar = self.dyn_covar.clone();
        for t in 0..horizon {
            let f = self.fm_at(t);
            let fo = f.slice(s![.., opponent.clone()]);

            let mut fm_t = fm.index_axis_mut(Axis(0), t);
            fm_t.slice_mut(s![.., ..dx])
                .assign(&(&f.slice(s![.., ..dx]) + &fo.dot(&policy.gain(t))));
            fm_t.slice_mut(s![.., dx..])
                .assign(&f.slice(s![.., own.clone()]));

            let mut fv_t = fv.index_axis_mut(Axis(0), t);
            fv_t += &fo.dot(&policy.bias(t));

            let mut cov_t = dyn_covar.index_axis_mut(Axis(0), t);
            cov_t += &fo.dot(&policy.covar(t)).dot(&fo.t());
        }
        Ok(Self { fm, fv, dyn_covar })
    }
}
