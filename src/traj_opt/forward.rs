//! Forward pass: state-action marginals of a controller
use crate::algorithm::TrajectoryInfo;
use crate::dynamics::LinearDynamics;
use crate::error::{check_shape, TrajOptError};
use crate::policy::{LinearGaussianPolicy, RobustLinearGaussianPolicy};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

/// Gaussian marginals of the joint vector `z_t = [x_t; u_t]` at each time step.
#[derive(Debug, Clone, PartialEq)]
pub struct Marginals {
    /// Means. Shape `(T, D)`.
    pub mu: Array2<f64>,
    /// Covariances. Shape `(T, D, D)`.
    pub sigma: Array3<f64>,
}

impl Marginals {
    pub fn horizon(&self) -> usize {
        self.mu.dim().0
    }

    pub fn dz(&self) -> usize {
        self.mu.dim().1
    }

    pub fn mu_at(&self, t: usize) -> ArrayView1<f64> {
        self.mu.index_axis(Axis(0), t)
    }

    pub fn sigma_at(&self, t: usize) -> ArrayView2<f64> {
        self.sigma.index_axis(Axis(0), t)
    }
}

/// Marginals of a single-agent controller under the trajectory dynamics.
pub fn forward(
    policy: &LinearGaussianPolicy,
    traj_info: &TrajectoryInfo,
) -> Result<Marginals, TrajOptError> {
    propagate(
        policy,
        &traj_info.dynamics,
        traj_info.x0mu.view(),
        traj_info.x0sigma.view(),
    )
}

/// Marginals over `[x; u]` with the adversary of `policy` held fixed.
pub fn forward_protagonist(
    policy: &RobustLinearGaussianPolicy,
    traj_info: &TrajectoryInfo,
) -> Result<Marginals, TrajOptError> {
    let (dx, du, dv) = (policy.dx(), policy.du(), policy.dv());
    let folded = traj_info.dynamics.fold_opponent(
        dx..dx + du,
        dx + du..dx + du + dv,
        policy.adversary(),
    )?;
    propagate(
        policy.protagonist(),
        &folded,
        traj_info.x0mu.view(),
        traj_info.x0sigma.view(),
    )
}

/// Marginals over `[x; v]` with the protagonist of `policy` held fixed.
pub fn forward_adversary(
    policy: &RobustLinearGaussianPolicy,
    traj_info: &TrajectoryInfo,
) -> Result<Marginals, TrajOptError> {
    let (dx, du, dv) = (policy.dx(), policy.du(), policy.dv());
    let folded = traj_info.dynamics.fold_opponent(
        dx + du..dx + du + dv,
        dx..dx + du,
        policy.protagonist(),
    )?;
    propagate(
        policy.adversary(),
        &folded,
        traj_info.x0mu.view(),
        traj_info.x0sigma.view(),
    )
}

/// Marginals over `[x; u; v]` of the joint protagonist / adversary law.
pub fn forward_robust(
    policy: &RobustLinearGaussianPolicy,
    traj_info: &TrajectoryInfo,
) -> Result<Marginals, TrajOptError> {
    forward(policy.joint(), traj_info)
}

/// Propagate the initial state distribution through `dynamics` under `policy`.
///
/// `dynamics` must act on `[x; u]` with `u` the action of `policy`.
pub(crate) fn propagate(
    policy: &LinearGaussianPolicy,
    dynamics: &LinearDynamics,
    x0mu: ArrayView1<f64>,
    x0sigma: ArrayView2<f64>,
) -> Result<Marginals, TrajOptError> {
    let (horizon, dx, du) = (policy.horizon(), policy.dx(), policy.du());
    let d = dx + du;
    check_shape("fm", &[horizon, dx, d], dynamics.fm().shape())?;
    check_shape("x0mu", &[dx], x0mu.shape())?;
    check_shape("x0sigma", &[dx, dx], x0sigma.shape())?;

    let mut mu = Array2::zeros((horizon, d));
    let mut sigma = Array3::zeros((horizon, d, d));

    let mut mu_x: Array1<f64> = x0mu.to_owned();
    let mut sigma_x: Array2<f64> = x0sigma.to_owned();
    for t in 0..horizon {
        let gain = policy.gain(t);
        let sigma_x_gain_t = sigma_x.dot(&gain.t());

        let mut sigma_t = sigma.index_axis_mut(Axis(0), t);
        sigma_t.slice_mut(s![..dx, ..dx]).assign(&sigma_x);
        sigma_t.slice_mut(s![..dx, dx..]).assign(&sigma_x_gain_t);
        sigma_t.slice_mut(s![dx.., ..dx]).assign(&sigma_x_gain_t.t());
        sigma_t
            .slice_mut(s![dx.., dx..])
            .assign(&(gain.dot(&sigma_x_gain_t) + policy.covar(t)));

        let mut mu_t = mu.index_axis_mut(Axis(0), t);
        mu_t.slice_mut(s![..dx]).assign(&mu_x);
        mu_t.slice_mut(s![dx..])
            .assign(&(gain.dot(&mu_x) + policy.bias(t)));

        if t + 1 < horizon {
            let f = dynamics.fm_at(t);
            sigma_x = f.dot(&sigma.index_axis(Axis(0), t)).dot(&f.t()) + dynamics.dyn_covar_at(t);
            mu_x = f.dot(&mu.index_axis(Axis(0), t)) + dynamics.fv_at(t);
        }
    }
    Ok(Marginals { mu, sigma })
}
