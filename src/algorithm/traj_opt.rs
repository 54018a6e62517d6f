//! Trajectory optimization with linear-Gaussian controllers only
use super::{augment_cost, Algorithm, IterationData, PolicyWeights, TrajectoryInfo};
use crate::error::{check_shape, TrajOptError};
use crate::logging::StatsLogger;
use crate::policy::LinearGaussianPolicy;
use crate::traj_opt::{estimate_cost, Eta, QuadraticCost, TrajOptLqr, TrajOptUpdate};
use log::debug;
use serde::{Deserialize, Serialize};

/// Step size configuration shared by the concrete algorithms.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    /// KL step per time step before the step multiplier.
    pub base_kl_step: f64,
    /// Entropy regularization added to eta when augmenting the cost.
    pub max_ent_traj: f64,
    pub min_step_mult: f64,
    pub max_step_mult: f64,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            base_kl_step: 0.2,
            max_ent_traj: 0.0,
            min_step_mult: 0.01,
            max_step_mult: 10.0,
        }
    }
}

/// Alternates local model fitting (done by the caller) with trust-region trajectory updates.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajOptAlgorithm {
    config: AlgorithmConfig,
    cur: Vec<IterationData>,
    prev: Vec<Option<IterationData>>,
    /// Controllers produced by the most recent update, not yet in effect.
    new_traj_distr: Vec<Option<LinearGaussianPolicy>>,
    policy_weights: Vec<Option<PolicyWeights>>,
    policy_linearization: Vec<Option<LinearGaussianPolicy>>,
}

impl TrajOptAlgorithm {
    /// An algorithm with one entry per condition.
    pub fn new(config: AlgorithmConfig, conditions: Vec<IterationData>) -> Self {
        let n = conditions.len();
        Self {
            config,
            cur: conditions,
            prev: vec![None; n],
            new_traj_distr: vec![None; n],
            policy_weights: vec![None; n],
            policy_linearization: vec![None; n],
        }
    }

    pub const fn config(&self) -> &AlgorithmConfig {
        &self.config
    }

    pub fn num_conditions(&self) -> usize {
        self.cur.len()
    }

    pub fn iteration_data_mut(&mut self, condition: usize) -> &mut IterationData {
        &mut self.cur[condition]
    }

    pub fn prev_iteration_data(&self, condition: usize) -> Option<&IterationData> {
        self.prev[condition].as_ref()
    }

    /// Controller from the most recent update of a condition.
    pub fn new_traj_distr(&self, condition: usize) -> Option<&LinearGaussianPolicy> {
        self.new_traj_distr[condition].as_ref()
    }

    /// Weight the value function recursion by global policy weights.
    pub fn set_policy_weights(&mut self, condition: usize, weights: PolicyWeights) {
        self.policy_weights[condition] = Some(weights);
    }

    /// Constrain updates of a condition towards a linearization of a global policy.
    pub fn set_policy_linearization(&mut self, condition: usize, policy: LinearGaussianPolicy) {
        self.policy_linearization[condition] = Some(policy);
    }

    /// Run the trust-region update for every condition.
    ///
    /// Each new dual variable is stored immediately; the new controllers take effect on
    /// [`TrajOptAlgorithm::advance`].
    pub fn update_trajectories(
        &mut self,
        solver: &TrajOptLqr,
        logger: &mut dyn StatsLogger,
    ) -> Result<Vec<TrajOptUpdate>, TrajOptError> {
        let updates = (0..self.num_conditions())
            .map(|m| solver.update(m, &*self, logger))
            .collect::<Result<Vec<_>, _>>()?;
        for (m, update) in updates.iter().enumerate() {
            self.cur[m].eta = update.eta.clone();
            self.cur[m].traj_info.last_kl_step = update.kl_step;
            self.new_traj_distr[m] = Some(update.traj_distr.clone());
        }
        Ok(updates)
    }

    /// Start a new iteration from freshly fitted local models.
    ///
    /// The current state becomes the previous state and the latest controllers take effect.
    /// Policy linearizations belong to the old local models and are dropped. The step
    /// multipliers are then adjusted from the predicted and actual improvement.
    pub fn advance(&mut self, traj_infos: Vec<TrajectoryInfo>) -> Result<(), TrajOptError> {
        check_shape("traj_infos", &[self.cur.len()], &[traj_infos.len()])?;
        for (m, traj_info) in traj_infos.into_iter().enumerate() {
            let traj_distr = self.new_traj_distr[m]
                .take()
                .unwrap_or_else(|| self.cur[m].traj_distr.clone());
            let next = IterationData {
                traj_info,
                traj_distr,
                step_mult: self.cur[m].step_mult,
                eta: self.cur[m].eta.clone(),
            };
            self.prev[m] = Some(std::mem::replace(&mut self.cur[m], next));
            self.policy_linearization[m] = None;
            self.step_adjust(m)?;
        }
        Ok(())
    }

    /// Adjust the step multiplier of a condition.
    ///
    /// Compares the improvement predicted by the previous local models with the improvement
    /// measured under the new ones. Returns the new multiplier.
    pub fn step_adjust(&mut self, condition: usize) -> Result<f64, TrajOptError> {
        let prev = match &self.prev[condition] {
            Some(prev) => prev,
            None => return Ok(self.cur[condition].step_mult),
        };
        let cur = &self.cur[condition];
        let previous_laplace_obj = estimate_cost(&prev.traj_distr, &prev.traj_info)?.sum();
        let new_predicted_laplace_obj = estimate_cost(&cur.traj_distr, &prev.traj_info)?.sum();
        let new_actual_laplace_obj = estimate_cost(&cur.traj_distr, &cur.traj_info)?.sum();

        let predicted_impr = previous_laplace_obj - new_predicted_laplace_obj;
        let actual_impr = previous_laplace_obj - new_actual_laplace_obj;
        debug!(
            "condition {}: predicted improvement {:.4e}, actual {:.4e}",
            condition, predicted_impr, actual_impr
        );

        let new_mult = (predicted_impr / (2.0 * (predicted_impr - actual_impr).max(1e-4)))
            .clamp(0.1, 5.0);
        let step_mult = (new_mult * cur.step_mult)
            .min(self.config.max_step_mult)
            .max(self.config.min_step_mult);
        self.cur[condition].step_mult = step_mult;
        Ok(step_mult)
    }
}

impl Algorithm for TrajOptAlgorithm {
    fn base_kl_step(&self) -> f64 {
        self.config.base_kl_step
    }

    fn iteration_data(&self, condition: usize) -> &IterationData {
        &self.cur[condition]
    }

    fn constraint_distr(&self, condition: usize) -> &LinearGaussianPolicy {
        self.policy_linearization[condition]
            .as_ref()
            .unwrap_or(&self.cur[condition].traj_distr)
    }

    fn compute_costs(
        &self,
        condition: usize,
        eta: &Eta,
        augment: bool,
    ) -> Result<QuadraticCost, TrajOptError> {
        let traj_info = &self.cur[condition].traj_info;
        let mut cost = traj_info.quadratic_cost();
        if augment {
            let policy = self.constraint_distr(condition);
            let (dx, du) = (policy.dx(), policy.du());
            check_shape(
                "cm",
                &[policy.horizon(), dx + du, dx + du],
                cost.cm.shape(),
            )?;
            augment_cost(&mut cost, policy, dx..dx + du, eta, self.config.max_ent_traj);
        }
        Ok(cost)
    }

    fn policy_weights(&self, condition: usize) -> Option<&PolicyWeights> {
        self.policy_weights[condition].as_ref()
    }
}
