//! Protagonist / adversary trajectory optimization
use super::{augment_cost, AlgorithmConfig, PolicyWeights, RobustAlgorithm, RobustIterationData};
use crate::error::{check_shape, TrajOptError};
use crate::logging::StatsLogger;
use crate::traj_opt::{Eta, QuadraticCost, RobustTrajOptUpdate, TrajOptLqr};

/// Trajectory optimization of a controller against a worst-case disturbance controller.
///
/// The protagonist minimizes the game cost and the adversary maximizes it. Each side is
/// kept within its own KL trust region.
#[derive(Debug, Clone, PartialEq)]
pub struct RobustTrajOptAlgorithm {
    config: AlgorithmConfig,
    cur: Vec<RobustIterationData>,
    policy_weights: Vec<Option<PolicyWeights>>,
}

impl RobustTrajOptAlgorithm {
    pub fn new(config: AlgorithmConfig, conditions: Vec<RobustIterationData>) -> Self {
        let n = conditions.len();
        Self {
            config,
            cur: conditions,
            policy_weights: vec![None; n],
        }
    }

    pub const fn config(&self) -> &AlgorithmConfig {
        &self.config
    }

    pub fn num_conditions(&self) -> usize {
        self.cur.len()
    }

    pub fn iteration_data_mut(&mut self, condition: usize) -> &mut RobustIterationData {
        &mut self.cur[condition]
    }

    pub fn set_policy_weights(&mut self, condition: usize, weights: PolicyWeights) {
        self.policy_weights[condition] = Some(weights);
    }

    /// Update both sides of every condition and put the new controllers in effect.
    pub fn update_trajectories(
        &mut self,
        solver: &TrajOptLqr,
        logger: &mut dyn StatsLogger,
    ) -> Result<Vec<RobustTrajOptUpdate>, TrajOptError> {
        let updates = (0..self.num_conditions())
            .map(|m| solver.update_robust(m, &*self, logger))
            .collect::<Result<Vec<_>, _>>()?;
        for (data, update) in self.cur.iter_mut().zip(&updates) {
            data.traj_distr = update.traj_distr.clone();
            data.eta = update.protagonist.eta.clone();
            data.eta_adv = update.adversary.eta.clone();
            data.traj_info.last_kl_step = update.protagonist.kl_step;
        }
        Ok(updates)
    }

    fn game_cost(&self, condition: usize) -> Result<QuadraticCost, TrajOptError> {
        let data = &self.cur[condition];
        let policy = &data.traj_distr;
        let d = policy.dx() + policy.du() + policy.dv();
        let cost = data.traj_info.quadratic_cost();
        check_shape("cm", &[policy.horizon(), d, d], cost.cm.shape())?;
        Ok(cost)
    }
}

impl RobustAlgorithm for RobustTrajOptAlgorithm {
    fn base_kl_step(&self) -> f64 {
        self.config.base_kl_step
    }

    fn iteration_data(&self, condition: usize) -> &RobustIterationData {
        &self.cur[condition]
    }

    fn compute_costs_protagonist(
        &self,
        condition: usize,
        eta: &Eta,
        augment: bool,
    ) -> Result<QuadraticCost, TrajOptError> {
        let mut cost = self.game_cost(condition)?;
        if augment {
            let policy = self.constraint_distr(condition);
            let (dx, du) = (policy.dx(), policy.du());
            augment_cost(
                &mut cost,
                policy.protagonist(),
                dx..dx + du,
                eta,
                self.config.max_ent_traj,
            );
        }
        Ok(cost)
    }

    fn compute_costs_adversary(
        &self,
        condition: usize,
        eta: &Eta,
        augment: bool,
    ) -> Result<QuadraticCost, TrajOptError> {
        let mut cost = self.game_cost(condition)?;
        cost.cm.mapv_inplace(|x| -x);
        cost.cv.mapv_inplace(|x| -x);
        if augment {
            let policy = self.constraint_distr(condition);
            let (dx, du, dv) = (policy.dx(), policy.du(), policy.dv());
            augment_cost(
                &mut cost,
                policy.adversary(),
                dx + du..dx + du + dv,
                eta,
                self.config.max_ent_traj,
            );
        }
        Ok(cost)
    }

    fn policy_weights(&self, condition: usize) -> Option<&PolicyWeights> {
        self.policy_weights[condition].as_ref()
    }
}
