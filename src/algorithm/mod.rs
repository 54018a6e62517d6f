//! Per-condition iteration state and the algorithm interface seen by the trajectory optimizer
mod robust;
mod traj_opt;

pub use robust::RobustTrajOptAlgorithm;
pub use traj_opt::{AlgorithmConfig, TrajOptAlgorithm};

use crate::dynamics::LinearDynamics;
use crate::error::{check_shape, TrajOptError};
use crate::policy::{LinearGaussianPolicy, RobustLinearGaussianPolicy};
use crate::traj_opt::{Eta, QuadraticCost};
use ndarray::{s, Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Local models of a single condition: fitted dynamics, initial state distribution and a
/// quadratic expansion of the cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryInfo {
    pub dynamics: LinearDynamics,
    /// Initial state mean. Shape `(dX,)`.
    pub x0mu: Array1<f64>,
    /// Initial state covariance. Shape `(dX, dX)`.
    pub x0sigma: Array2<f64>,
    /// Constant cost term. Shape `(T,)`.
    pub cc: Array1<f64>,
    /// Linear cost term. Shape `(T, D)`.
    pub cv: Array2<f64>,
    /// Quadratic cost term. Shape `(T, D, D)`.
    pub cm: Array3<f64>,
    /// KL step used on the most recent update.
    pub last_kl_step: f64,
}

impl TrajectoryInfo {
    /// Trajectory info with a zero cost.
    pub fn new(
        dynamics: LinearDynamics,
        x0mu: Array1<f64>,
        x0sigma: Array2<f64>,
    ) -> Result<Self, TrajOptError> {
        let (horizon, dx, d) = (dynamics.horizon(), dynamics.dx(), dynamics.dz());
        check_shape("x0mu", &[dx], x0mu.shape())?;
        check_shape("x0sigma", &[dx, dx], x0sigma.shape())?;
        Ok(Self {
            dynamics,
            x0mu,
            x0sigma,
            cc: Array1::zeros(horizon),
            cv: Array2::zeros((horizon, d)),
            cm: Array3::zeros((horizon, d, d)),
            last_kl_step: f64::INFINITY,
        })
    }

    /// Set the quadratic cost expansion.
    pub fn with_cost(
        mut self,
        cc: Array1<f64>,
        cv: Array2<f64>,
        cm: Array3<f64>,
    ) -> Result<Self, TrajOptError> {
        check_shape("cc", self.cc.shape(), cc.shape())?;
        check_shape("cv", self.cv.shape(), cv.shape())?;
        check_shape("cm", self.cm.shape(), cm.shape())?;
        self.cc = cc;
        self.cv = cv;
        self.cm = cm;
        Ok(self)
    }

    pub fn horizon(&self) -> usize {
        self.dynamics.horizon()
    }

    /// The quadratic and linear cost terms.
    pub fn quadratic_cost(&self) -> QuadraticCost {
        QuadraticCost {
            cm: self.cm.clone(),
            cv: self.cv.clone(),
        }
    }
}

/// Iteration state of one condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationData {
    pub traj_info: TrajectoryInfo,
    /// Current controller.
    pub traj_distr: LinearGaussianPolicy,
    /// Multiplier on the base KL step.
    pub step_mult: f64,
    /// Dual variable of the KL constraint.
    pub eta: Eta,
}

impl IterationData {
    pub fn new(traj_info: TrajectoryInfo, traj_distr: LinearGaussianPolicy) -> Self {
        Self {
            traj_info,
            traj_distr,
            step_mult: 1.0,
            eta: Eta::scalar(1.0),
        }
    }
}

/// Iteration state of one condition of a protagonist / adversary game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustIterationData {
    pub traj_info: TrajectoryInfo,
    pub traj_distr: RobustLinearGaussianPolicy,
    pub step_mult: f64,
    /// Dual variable of the protagonist KL constraint.
    pub eta: Eta,
    /// Dual variable of the adversary KL constraint.
    pub eta_adv: Eta,
}

impl RobustIterationData {
    pub fn new(traj_info: TrajectoryInfo, traj_distr: RobustLinearGaussianPolicy) -> Self {
        Self {
            traj_info,
            traj_distr,
            step_mult: 1.0,
            eta: Eta::scalar(1.0),
            eta_adv: Eta::scalar(1.0),
        }
    }
}

/// Per-time-step weights of a global policy term in the objective.
///
/// When present, the value function passed from `t + 1` to `t` is scaled by
/// `(w_{t+1} + eta) / (w_t + eta)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyWeights(Array1<f64>);

impl PolicyWeights {
    pub fn new(weights: Array1<f64>) -> Self {
        Self(weights)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value function multiplier from `t + 1` to `t`.
    pub fn ratio(&self, t: usize, eta: f64) -> f64 {
        (self.0[t + 1] + eta) / (self.0[t] + eta)
    }
}

/// What the trajectory optimizer needs from an algorithm.
pub trait Algorithm {
    /// KL step per time step before the step multiplier.
    fn base_kl_step(&self) -> f64;

    /// Iteration state of a condition.
    fn iteration_data(&self, condition: usize) -> &IterationData;

    /// The controller the KL trust region is measured against.
    ///
    /// Defaults to the current controller. Algorithms that constrain towards a linearization
    /// of a global policy return that linearization instead.
    fn constraint_distr(&self, condition: usize) -> &LinearGaussianPolicy {
        &self.iteration_data(condition).traj_distr
    }

    /// Cost for the backward pass.
    ///
    /// With `augment`, the KL term against [`Algorithm::constraint_distr`] is folded into
    /// the cost, weighted by `eta`.
    fn compute_costs(
        &self,
        condition: usize,
        eta: &Eta,
        augment: bool,
    ) -> Result<QuadraticCost, TrajOptError>;

    /// Per-time-step global policy weights, if the algorithm has them.
    fn policy_weights(&self, _condition: usize) -> Option<&PolicyWeights> {
        None
    }
}

/// What the trajectory optimizer needs from a protagonist / adversary algorithm.
pub trait RobustAlgorithm {
    /// KL step per time step before the step multiplier.
    fn base_kl_step(&self) -> f64;

    fn iteration_data(&self, condition: usize) -> &RobustIterationData;

    /// The controller pair the KL trust regions are measured against.
    fn constraint_distr(&self, condition: usize) -> &RobustLinearGaussianPolicy {
        &self.iteration_data(condition).traj_distr
    }

    /// Cost minimized by the protagonist, over `[x; u; v]`.
    fn compute_costs_protagonist(
        &self,
        condition: usize,
        eta: &Eta,
        augment: bool,
    ) -> Result<QuadraticCost, TrajOptError>;

    /// Cost minimized by the adversary, over `[x; u; v]`.
    fn compute_costs_adversary(
        &self,
        condition: usize,
        eta: &Eta,
        augment: bool,
    ) -> Result<QuadraticCost, TrajOptError>;

    fn policy_weights(&self, _condition: usize) -> Option<&PolicyWeights> {
        None
    }
}

/// Fold the KL term against `policy` into a cost over `[x; ...; a; ...]`.
///
/// The policy acts on the state block `..dX` and produces the action block `action`.
/// Each time step becomes `C / (eta + ent) + eta / (eta + ent) · KL terms`.
pub(crate) fn augment_cost(
    cost: &mut QuadraticCost,
    policy: &LinearGaussianPolicy,
    action: Range<usize>,
    eta: &Eta,
    max_ent: f64,
) {
    let dx = policy.dx();
    let (a0, a1) = (action.start, action.end);
    for t in 0..cost.horizon() {
        let e = eta.at(t);
        let scale = 1.0 / (e + max_ent);
        let weight = e / (e + max_ent);
        let terms = policy.divergence_terms(t);

        let mut cm = cost.cm.index_axis_mut(Axis(0), t);
        cm *= scale;
        let m = &terms.m;
        cm.slice_mut(s![..dx, ..dx])
            .scaled_add(weight, &m.slice(s![..dx, ..dx]));
        cm.slice_mut(s![..dx, a0..a1])
            .scaled_add(weight, &m.slice(s![..dx, dx..]));
        cm.slice_mut(s![a0..a1, ..dx])
            .scaled_add(weight, &m.slice(s![dx.., ..dx]));
        cm.slice_mut(s![a0..a1, a0..a1])
            .scaled_add(weight, &m.slice(s![dx.., dx..]));

        let mut cv = cost.cv.index_axis_mut(Axis(0), t);
        cv *= scale;
        cv.slice_mut(s![..dx])
            .scaled_add(weight, &terms.v.slice(s![..dx]));
        cv.slice_mut(s![a0..a1])
            .scaled_add(weight, &terms.v.slice(s![dx..]));
    }
}
