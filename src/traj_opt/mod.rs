//! LQR trajectory optimization under a KL trust region
mod backward;
mod config;
mod cost;
mod dgd;
mod eta;
mod forward;
mod kl;

pub use backward::BackwardPass;
pub use config::{AdamConfig, ConstraintMode, TrajOptConfig, UpdateStrategy};
pub use cost::{estimate_cost, QuadraticCost};
pub use dgd::{conv_check, RobustTrajOptUpdate, TrajOptUpdate};
pub use eta::Eta;
pub use forward::{forward, forward_adversary, forward_protagonist, forward_robust, Marginals};
pub use kl::{traj_distr_kl, traj_distr_kl_alt};

use crate::algorithm::{Algorithm, RobustAlgorithm, TrajectoryInfo};
use crate::error::TrajOptError;
use crate::logging::StatsLogger;
use crate::policy::{LinearGaussianPolicy, RobustLinearGaussianPolicy};
use backward::{LqrProblem, Opponent};
use log::debug;

/// LQR trajectory optimizer.
///
/// Each update finds the dual variable eta for which the new controller's divergence from
/// the constraint controller matches the KL step of the condition.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrajOptLqr {
    config: TrajOptConfig,
}

impl TrajOptLqr {
    pub const fn new(config: TrajOptConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &TrajOptConfig {
        &self.config
    }

    /// Whether the augmented cost is used in the backward pass.
    ///
    /// Per-step constraints fold the KL term into the Q-function directly instead.
    fn augment(&self) -> bool {
        self.config.constraint_mode == ConstraintMode::PerTrajectory
    }

    /// Trust-region update of a single-agent condition.
    pub fn update<A: Algorithm + ?Sized>(
        &self,
        condition: usize,
        algorithm: &A,
        logger: &mut dyn StatsLogger,
    ) -> Result<TrajOptUpdate, TrajOptError> {
        let data = algorithm.iteration_data(condition);
        let prev = algorithm.constraint_distr(condition);
        let (dx, du) = (prev.dx(), prev.du());
        let problem = LqrProblem::new(
            &self.config,
            prev,
            &data.traj_info,
            dx..dx + du,
            None,
            algorithm.policy_weights(condition),
        )?;
        let augment = self.augment();
        let costs = |eta: &Eta| algorithm.compute_costs(condition, eta, augment);
        let kl_step = algorithm.base_kl_step() * data.step_mult;
        debug!("condition {}: KL step {:.4e} per time step", condition, kl_step);
        problem.solve(&data.eta, kl_step, logger, &costs)
    }

    /// Update the protagonist of a condition against its current adversary.
    pub fn update_protagonist<A: RobustAlgorithm + ?Sized>(
        &self,
        condition: usize,
        algorithm: &A,
        logger: &mut dyn StatsLogger,
    ) -> Result<TrajOptUpdate, TrajOptError> {
        let opponent = algorithm.constraint_distr(condition).adversary();
        self.update_side(Side::Protagonist, condition, algorithm, opponent, logger)
    }

    /// Update the adversary of a condition against its current protagonist.
    pub fn update_adversary<A: RobustAlgorithm + ?Sized>(
        &self,
        condition: usize,
        algorithm: &A,
        logger: &mut dyn StatsLogger,
    ) -> Result<TrajOptUpdate, TrajOptError> {
        let opponent = algorithm.constraint_distr(condition).protagonist();
        self.update_side(Side::Adversary, condition, algorithm, opponent, logger)
    }

    /// Update the protagonist, then the adversary against the new protagonist.
    pub fn update_robust<A: RobustAlgorithm + ?Sized>(
        &self,
        condition: usize,
        algorithm: &A,
        logger: &mut dyn StatsLogger,
    ) -> Result<RobustTrajOptUpdate, TrajOptError> {
        let protagonist = self.update_protagonist(condition, algorithm, logger)?;
        let adversary = self.update_side(
            Side::Adversary,
            condition,
            algorithm,
            &protagonist.traj_distr,
            logger,
        )?;
        let traj_distr = RobustLinearGaussianPolicy::new(
            protagonist.traj_distr.clone(),
            adversary.traj_distr.clone(),
        )?;
        Ok(RobustTrajOptUpdate {
            traj_distr,
            protagonist,
            adversary,
        })
    }

    fn update_side<A: RobustAlgorithm + ?Sized>(
        &self,
        side: Side,
        condition: usize,
        algorithm: &A,
        opponent: &LinearGaussianPolicy,
        logger: &mut dyn StatsLogger,
    ) -> Result<TrajOptUpdate, TrajOptError> {
        let data = algorithm.iteration_data(condition);
        let constraint = algorithm.constraint_distr(condition);
        let problem = side.problem(
            &self.config,
            constraint,
            opponent,
            &data.traj_info,
            algorithm.policy_weights(condition),
        )?;
        let augment = self.augment();
        let kl_step = algorithm.base_kl_step() * data.step_mult;
        match side {
            Side::Protagonist => {
                let costs = |eta: &Eta| algorithm.compute_costs_protagonist(condition, eta, augment);
                problem.solve(&data.eta, kl_step, logger, &costs)
            }
            Side::Adversary => {
                let costs = |eta: &Eta| algorithm.compute_costs_adversary(condition, eta, augment);
                problem.solve(&data.eta_adv, kl_step, logger, &costs)
            }
        }
    }

    /// A single backward pass for a single-agent condition.
    pub fn backward<A: Algorithm + ?Sized>(
        &self,
        prev: &LinearGaussianPolicy,
        traj_info: &TrajectoryInfo,
        eta: &Eta,
        algorithm: &A,
        condition: usize,
    ) -> Result<BackwardPass, TrajOptError> {
        let (dx, du) = (prev.dx(), prev.du());
        let problem = LqrProblem::new(
            &self.config,
            prev,
            traj_info,
            dx..dx + du,
            None,
            algorithm.policy_weights(condition),
        )?;
        let augment = self.augment();
        problem.backward(eta, &|eta: &Eta| {
            algorithm.compute_costs(condition, eta, augment)
        })
    }

    /// A single backward pass for the protagonist with the adversary of `prev` fixed.
    pub fn backward_protagonist<A: RobustAlgorithm + ?Sized>(
        &self,
        prev: &RobustLinearGaussianPolicy,
        traj_info: &TrajectoryInfo,
        eta: &Eta,
        algorithm: &A,
        condition: usize,
    ) -> Result<BackwardPass, TrajOptError> {
        let problem = Side::Protagonist.problem(
            &self.config,
            prev,
            prev.adversary(),
            traj_info,
            algorithm.policy_weights(condition),
        )?;
        let augment = self.augment();
        problem.backward(eta, &|eta: &Eta| {
            algorithm.compute_costs_protagonist(condition, eta, augment)
        })
    }

    /// A single backward pass for the adversary with the protagonist of `prev` fixed.
    pub fn backward_adversary<A: RobustAlgorithm + ?Sized>(
        &self,
        prev: &RobustLinearGaussianPolicy,
        traj_info: &TrajectoryInfo,
        eta: &Eta,
        algorithm: &A,
        condition: usize,
    ) -> Result<BackwardPass, TrajOptError> {
        let problem = Side::Adversary.problem(
            &self.config,
            prev,
            prev.protagonist(),
            traj_info,
            algorithm.policy_weights(condition),
        )?;
        let augment = self.augment();
        problem.backward(eta, &|eta: &Eta| {
            algorithm.compute_costs_adversary(condition, eta, augment)
        })
    }

    /// Whether a constraint violation is within the configured tolerance of the KL step.
    pub fn conv_check(&self, con: &ndarray::Array1<f64>, kl_step: &ndarray::Array1<f64>) -> bool {
        conv_check(con, kl_step, self.config.convergence_tolerance)
    }
}

/// Which half of a protagonist / adversary pair is being optimized.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Side {
    Protagonist,
    Adversary,
}

impl Side {
    /// The problem for this side with `opponent` held fixed.
    ///
    /// The trust region is measured against this side's controller in `constraint`.
    fn problem<'a>(
        self,
        config: &'a TrajOptConfig,
        constraint: &'a RobustLinearGaussianPolicy,
        opponent: &'a LinearGaussianPolicy,
        traj_info: &'a TrajectoryInfo,
        policy_weights: Option<&'a crate::algorithm::PolicyWeights>,
    ) -> Result<LqrProblem<'a>, TrajOptError> {
        let (dx, du, dv) = (constraint.dx(), constraint.du(), constraint.dv());
        let (prev, own, block) = match self {
            Self::Protagonist => (constraint.protagonist(), dx..dx + du, dx + du..dx + du + dv),
            Self::Adversary => (constraint.adversary(), dx + du..dx + du + dv, dx..dx + du),
        };
        LqrProblem::new(
            config,
            prev,
            traj_info,
            own,
            Some(Opponent {
                block,
                policy: opponent,
            }),
            policy_weights,
        )
    }
}
