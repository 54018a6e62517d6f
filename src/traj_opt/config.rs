//! Trajectory optimizer configuration
use serde::{Deserialize, Serialize};

/// How the KL trust region is applied over the horizon.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintMode {
    /// One budget for the whole trajectory; `eta` has length 1.
    PerTrajectory,
    /// One budget per time step; `eta` has length `T`.
    PerStep,
}

impl Default for ConstraintMode {
    fn default() -> Self {
        Self::PerTrajectory
    }
}

/// How the backward pass assembles the new controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateStrategy {
    /// Fill an all-NaN blank one time step at a time.
    BuildFresh,
    /// Stage each time step and overwrite a copy of the previous controller once the sweep
    /// succeeds.
    MutateExisting,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self::MutateExisting
    }
}

/// Adam hyper-parameters for the per-step dual ascent fallback.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Step size.
    pub alpha: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            alpha: 0.005,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Configuration for [`TrajOptLqr`](super::TrajOptLqr).
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajOptConfig {
    pub constraint_mode: ConstraintMode,
    /// Measure the KL divergence under the state marginals of the previous controller.
    pub use_prev_distr: bool,
    pub update_strategy: UpdateStrategy,
    /// Lower bound on the dual variable.
    pub min_eta: f64,
    /// Upper bound on the dual variable.
    pub max_eta: f64,
    /// Initial eta increment when the action Hessian is not positive definite.
    pub del0: f64,
    /// Regularized eta at which the backward pass gives up.
    pub eta_error_threshold: f64,
    /// Bracketing iterations in per-trajectory mode.
    pub dgd_max_iter: usize,
    /// Bracketing iterations in per-step mode.
    pub dgd_max_ls_iter: usize,
    /// Adam iterations in per-step mode.
    pub dgd_max_gd_iter: usize,
    pub adam: AdamConfig,
    /// Converged when `|KL - kl_step| < convergence_tolerance * kl_step`.
    pub convergence_tolerance: f64,
}

impl Default for TrajOptConfig {
    fn default() -> Self {
        Self {
            constraint_mode: ConstraintMode::default(),
            use_prev_distr: false,
            update_strategy: UpdateStrategy::default(),
            min_eta: 1e-8,
            max_eta: 1e16,
            del0: 1e-4,
            eta_error_threshold: 1e16,
            dgd_max_iter: 50,
            dgd_max_ls_iter: 20,
            dgd_max_gd_iter: 200,
            adam: AdamConfig::default(),
            convergence_tolerance: 0.1,
        }
    }
}

impl TrajOptConfig {
    /// Number of bracketing iterations for the configured constraint mode.
    pub const fn bracket_iterations(&self) -> usize {
        match self.constraint_mode {
            ConstraintMode::PerTrajectory => self.dgd_max_iter,
            ConstraintMode::PerStep => self.dgd_max_ls_iter,
        }
    }
}
