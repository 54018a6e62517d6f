//! Dual gradient descent on the KL multiplier
use super::backward::{BackwardPass, LqrProblem};
use super::config::{ConstraintMode, TrajOptConfig};
use super::cost::QuadraticCost;
use super::eta::{Eta, EtaBracket};
use super::forward::{propagate, Marginals};
use super::kl::{traj_distr_kl, traj_distr_kl_alt};
use crate::error::TrajOptError;
use crate::logging::{Loggable, StatsLogger};
use crate::policy::{LinearGaussianPolicy, RobustLinearGaussianPolicy};
use log::{debug, warn};
use ndarray::{s, Array1};

/// Result of a trust-region controller update.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajOptUpdate {
    /// The new controller.
    pub traj_distr: LinearGaussianPolicy,
    /// The dual variable that produced `traj_distr`.
    pub eta: Eta,
    /// Per-time-step KL divergence of `traj_distr` from the constraint controller.
    pub kl_divergence: Array1<f64>,
    /// KL budget: the whole-trajectory total, or the value per time step.
    pub kl_step: f64,
    /// Whether the constraint was satisfied within tolerance.
    pub converged: bool,
    /// Number of backward passes run.
    pub iterations: usize,
}

/// Result of a protagonist then adversary update.
#[derive(Debug, Clone, PartialEq)]
pub struct RobustTrajOptUpdate {
    pub traj_distr: RobustLinearGaussianPolicy,
    pub protagonist: TrajOptUpdate,
    pub adversary: TrajOptUpdate,
}

/// Whether the constraint violation is within `tolerance` of the KL step.
///
/// Every component must satisfy `|con| < tolerance · kl_step`.
pub fn conv_check(con: &Array1<f64>, kl_step: &Array1<f64>, tolerance: f64) -> bool {
    con.iter()
        .zip(kl_step)
        .all(|(c, step)| c.abs() < tolerance * step)
}

/// Adam moment estimates for per-step eta.
#[derive(Debug, Clone)]
struct Adam {
    m: Array1<f64>,
    v: Array1<f64>,
    steps: i32,
}

impl Adam {
    fn new(len: usize) -> Self {
        Self {
            m: Array1::zeros(len),
            v: Array1::zeros(len),
            steps: 0,
        }
    }

    /// Ascend `eta` along `grad`.
    fn step(&mut self, config: &TrajOptConfig, eta: &mut Array1<f64>, grad: &Array1<f64>) {
        let adam = &config.adam;
        self.steps = self.steps.saturating_add(1);
        self.m = &self.m * adam.beta1 + grad * (1.0 - adam.beta1);
        self.v = &self.v * adam.beta2 + &grad.mapv(|g| g * g) * (1.0 - adam.beta2);
        let m_hat = &self.m / (1.0 - adam.beta1.powi(self.steps));
        let v_hat = &self.v / (1.0 - adam.beta2.powi(self.steps));
        let delta = m_hat / (v_hat.mapv(f64::sqrt) + adam.epsilon) * adam.alpha;
        *eta += &delta;
        eta.mapv_inplace(|e| e.clamp(config.min_eta, config.max_eta));
    }
}

fn log_stat(logger: &mut dyn StatsLogger, name: &'static str, value: Loggable) {
    if let Err(err) = logger.log(name, value) {
        warn!("{}", err);
    }
}

impl<'a> LqrProblem<'a> {
    /// Marginals of a controller for this problem's own action block.
    pub fn forward(&self, policy: &LinearGaussianPolicy) -> Result<Marginals, TrajOptError> {
        propagate(
            policy,
            &self.effective_dynamics,
            self.traj_info.x0mu.view(),
            self.traj_info.x0sigma.view(),
        )
    }

    /// Per-time-step KL divergence of `policy` from the constraint controller.
    pub fn kl_divergence(&self, policy: &LinearGaussianPolicy) -> Result<Array1<f64>, TrajOptError> {
        match &self.prev_marginals {
            Some(prev_marginals) => traj_distr_kl_alt(prev_marginals, policy, self.prev),
            None => traj_distr_kl(&self.forward(policy)?, policy, self.prev),
        }
    }

    /// Search for the eta whose controller meets the KL step.
    ///
    /// `kl_step_per_t` is the KL allowance of a single time step. Starts with geometric
    /// bisection on eta and, for per-step constraints that have not converged, continues
    /// with Adam on the constraint violation.
    pub fn solve(
        &self,
        eta0: &Eta,
        kl_step_per_t: f64,
        logger: &mut dyn StatsLogger,
        costs: &dyn Fn(&Eta) -> Result<QuadraticCost, TrajOptError>,
    ) -> Result<TrajOptUpdate, TrajOptError> {
        let config = self.config;
        let mode = config.constraint_mode;
        let horizon = self.prev.horizon();
        if horizon == 0 {
            return Err(TrajOptError::EtaLength {
                actual: eta0.len(),
                horizon,
            });
        }
        #[allow(clippy::cast_precision_loss)]
        let kl_step = match mode {
            ConstraintMode::PerTrajectory => Array1::from_elem(1, kl_step_per_t * horizon as f64),
            ConstraintMode::PerStep => Array1::from_elem(horizon, kl_step_per_t),
        };
        let constraint = |kl: &Array1<f64>| match mode {
            ConstraintMode::PerTrajectory => Array1::from_elem(1, kl.sum() - kl_step[0]),
            ConstraintMode::PerStep => kl - &kl_step,
        };

        let mut eta = eta0.for_mode(mode, horizon)?;
        let mut bracket = EtaBracket::new(eta.len(), config.min_eta, config.max_eta);
        let mut iterations = 0;
        let mut converged = false;
        let mut last: Option<(BackwardPass, Array1<f64>)> = None;

        for itr in 0..config.bracket_iterations().max(1) {
            let pass = self.backward(&eta, costs)?;
            iterations += 1;
            eta = pass.eta.clone();
            let kl = self.kl_divergence(&pass.traj_distr)?;
            let con = constraint(&kl);
            debug!(
                "DGD iteration {}: eta {:.4e}, KL {:.4e} / {:.4e}",
                itr,
                eta.mean(),
                kl.sum(),
                kl_step.sum()
            );
            self.log_iteration(logger, &eta, &kl, &con, pass.retries);

            converged = conv_check(&con, &kl_step, config.convergence_tolerance);
            if converged {
                last = Some((pass, kl));
                break;
            }
            bracket.update(&mut eta, &con);
            last = Some((pass, kl));
        }

        if mode == ConstraintMode::PerStep && !converged && horizon > 1 {
            let mut adam = Adam::new(horizon - 1);
            for _ in 0..config.dgd_max_gd_iter {
                let pass = self.backward(&eta, costs)?;
                iterations += 1;
                eta = pass.eta.clone();
                let kl = self.kl_divergence(&pass.traj_distr)?;
                let con = constraint(&kl);
                self.log_iteration(logger, &eta, &kl, &con, pass.retries);

                converged = conv_check(&con, &kl_step, config.convergence_tolerance);
                last = Some((pass, kl));
                if converged {
                    break;
                }
                let mut active = eta.values().slice(s![..horizon - 1]).to_owned();
                let grad = con.slice(s![..horizon - 1]).to_owned();
                adam.step(config, &mut active, &grad);
                eta.values_mut().slice_mut(s![..horizon - 1]).assign(&active);
            }
        }

        let (pass, kl) = match last {
            Some(last) => last,
            None => {
                let pass = self.backward(&eta, costs)?;
                let kl = self.kl_divergence(&pass.traj_distr)?;
                (pass, kl)
            }
        };
        #[allow(clippy::cast_precision_loss)]
        let kl_step_mean = kl_step.sum() / horizon as f64;
        if !converged && kl.mean().unwrap_or(0.0) > kl_step_mean {
            warn!("Final KL divergence after DGD convergence is too high");
        }

        Ok(TrajOptUpdate {
            traj_distr: pass.traj_distr,
            eta: pass.eta,
            kl_divergence: kl,
            kl_step: kl_step[0],
            converged,
            iterations,
        })
    }

    fn log_iteration(
        &self,
        logger: &mut dyn StatsLogger,
        eta: &Eta,
        kl: &Array1<f64>,
        con: &Array1<f64>,
        retries: usize,
    ) {
        log_stat(logger, "eta", eta.mean().into());
        log_stat(logger, "kl_divergence", kl.sum().into());
        log_stat(logger, "constraint", con.sum().into());
        #[allow(clippy::cast_precision_loss)]
        log_stat(logger, "retries", (retries as f64).into());
        if self.config.constraint_mode == ConstraintMode::PerStep {
            log_stat(logger, "eta_per_step", eta.values().to_vec().into());
        }
        logger.done();
    }
}
