//! LQR backward pass
use super::config::{ConstraintMode, TrajOptConfig, UpdateStrategy};
use super::cost::QuadraticCost;
use super::eta::Eta;
use super::forward::Marginals;
use crate::algorithm::{PolicyWeights, TrajectoryInfo};
use crate::dynamics::LinearDynamics;
use crate::error::{check_shape, TrajOptError};
use crate::linalg;
use crate::policy::{LinearGaussianPolicy, PolicyStep};
use log::{debug, warn};
use ndarray::{s, Array1, Array2};
use std::borrow::Cow;
use std::ops::Range;

/// Result of a backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardPass {
    /// The new controller.
    pub traj_distr: LinearGaussianPolicy,
    /// The dual variable after any regularization increases.
    pub eta: Eta,
    /// Number of times the sweep was restarted with a larger eta.
    pub retries: usize,
}

/// An opponent policy held fixed during a backward pass.
#[derive(Debug, Clone)]
pub(crate) struct Opponent<'a> {
    /// Columns of the joint vector holding the opponent action.
    pub block: Range<usize>,
    pub policy: &'a LinearGaussianPolicy,
}

/// One side of a trajectory optimization problem.
///
/// Bundles everything the backward pass, the forward pass and the KL divergence need for a
/// controller acting on the `own` block of the joint vector `[x; ...]`.
#[derive(Debug)]
pub(crate) struct LqrProblem<'a> {
    pub config: &'a TrajOptConfig,
    /// The controller the trust region is measured against.
    pub prev: &'a LinearGaussianPolicy,
    pub traj_info: &'a TrajectoryInfo,
    pub own: Range<usize>,
    pub opponent: Option<Opponent<'a>>,
    pub policy_weights: Option<&'a PolicyWeights>,
    /// Dynamics over `[x; own]` with any opponent folded in.
    pub effective_dynamics: Cow<'a, LinearDynamics>,
    /// Marginals of `prev`, when the KL divergence is measured under them.
    pub prev_marginals: Option<Marginals>,
}

enum Sweep {
    Complete(LinearGaussianPolicy),
    Failed { time_step: usize },
}

impl<'a> LqrProblem<'a> {
    /// A problem over the full joint vector of `traj_info`.
    ///
    /// # Errors
    /// [`TrajOptError::NanDynamics`] if the dynamics contain NaN, or a shape error if the
    /// blocks do not match the dynamics and policies.
    pub fn new(
        config: &'a TrajOptConfig,
        prev: &'a LinearGaussianPolicy,
        traj_info: &'a TrajectoryInfo,
        own: Range<usize>,
        opponent: Option<Opponent<'a>>,
        policy_weights: Option<&'a PolicyWeights>,
    ) -> Result<Self, TrajOptError> {
        let dynamics = &traj_info.dynamics;
        if dynamics.has_nan() {
            return Err(TrajOptError::NanDynamics);
        }
        let (horizon, dx, du) = (prev.horizon(), prev.dx(), prev.du());
        let d = dx + du + opponent.as_ref().map_or(0, |o| o.block.len());
        check_shape("fm", &[horizon, dx, d], dynamics.fm().shape())?;
        check_shape("own action block", &[du], &[own.len()])?;
        if let Some(weights) = policy_weights {
            check_shape("policy weights", &[horizon], &[weights.len()])?;
        }

        let effective_dynamics = match &opponent {
            Some(opponent) => Cow::Owned(dynamics.fold_opponent(
                own.clone(),
                opponent.block.clone(),
                opponent.policy,
            )?),
            None => Cow::Borrowed(dynamics),
        };
        let mut problem = Self {
            config,
            prev,
            traj_info,
            own,
            opponent,
            policy_weights,
            effective_dynamics,
            prev_marginals: None,
        };
        if config.use_prev_distr {
            problem.prev_marginals = Some(problem.forward(prev)?);
        }
        Ok(problem)
    }

    /// Largest number of eta increases for a single eta component.
    fn max_retries(&self) -> usize {
        let ratio = self.config.eta_error_threshold / self.config.del0;
        if self.config.del0 > 0.0 && ratio.is_finite() && ratio > 1.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let doublings = ratio.log2().ceil() as usize;
            doublings.saturating_add(1)
        } else {
            0
        }
    }

    /// Compute a new controller for `eta`, increasing eta wherever the action Hessian is not
    /// positive definite.
    ///
    /// `costs` gives the cost over the joint vector for a value of eta.
    ///
    /// # Errors
    /// [`TrajOptError::IllConditioned`] if eta reaches `eta_error_threshold` or the retry
    /// bound without producing a positive definite Hessian.
    pub fn backward(
        &self,
        eta: &Eta,
        costs: &dyn Fn(&Eta) -> Result<QuadraticCost, TrajOptError>,
    ) -> Result<BackwardPass, TrajOptError> {
        let mode = self.config.constraint_mode;
        let horizon = self.prev.horizon();
        let eta0 = eta.for_mode(mode, horizon)?;
        let mut eta = eta0.clone();
        let mut del = Array1::from_elem(eta.len(), self.config.del0);
        let mut component_retries = vec![0_usize; eta.len()];
        let max_retries = self.max_retries();
        let mut retries = 0;

        loop {
            let cost = costs(&eta)?;
            let d = self.traj_info.dynamics.dz();
            check_shape("cm", &[horizon, d, d], cost.cm.shape())?;
            check_shape("cv", &[horizon, d], cost.cv.shape())?;

            match self.sweep(&eta, &cost)? {
                Sweep::Complete(traj_distr) => {
                    return Ok(BackwardPass {
                        traj_distr,
                        eta,
                        retries,
                    })
                }
                Sweep::Failed { time_step } => {
                    let i = match mode {
                        ConstraintMode::PerTrajectory => 0,
                        ConstraintMode::PerStep => time_step,
                    };
                    let old_eta = eta.values()[i];
                    let new_eta = eta0.values()[i] + del[i];
                    del[i] *= 2.0;
                    component_retries[i] += 1;
                    retries += 1;
                    debug!(
                        "non-PD action Hessian at t = {}; increasing eta[{}]: {:e} -> {:e}",
                        time_step, i, old_eta, new_eta
                    );
                    if new_eta >= self.config.eta_error_threshold
                        || component_retries[i] > max_retries
                        || !new_eta.is_finite()
                    {
                        return Err(TrajOptError::IllConditioned {
                            eta: new_eta,
                            time_step: Some(time_step),
                        });
                    }
                    eta.values_mut()[i] = new_eta;
                }
            }
        }
    }

    /// One dynamic programming sweep from `T - 1` down to `0`.
    fn sweep(&self, eta: &Eta, cost: &QuadraticCost) -> Result<Sweep, TrajOptError> {
        let horizon = self.prev.horizon();
        let (dx, du) = (self.prev.dx(), self.prev.du());
        let d = cost.dz();
        let (u0, u1) = (self.own.start, self.own.end);
        let dynamics = &self.traj_info.dynamics;

        let mut fresh = match self.config.update_strategy {
            UpdateStrategy::BuildFresh => Some(self.prev.nans_like()),
            UpdateStrategy::MutateExisting => None,
        };
        let mut staged = Vec::new();

        let mut vxx = Array2::<f64>::zeros((dx, dx));
        let mut vx = Array1::<f64>::zeros(dx);
        for t in (0..horizon).rev() {
            let mut qtt = cost.cm_at(t).to_owned();
            let mut qt = cost.cv_at(t).to_owned();
            if t + 1 < horizon {
                let multiplier = self
                    .policy_weights
                    .map_or(1.0, |weights| weights.ratio(t, eta.at(t)));
                let f = dynamics.fm_at(t);
                qtt.scaled_add(multiplier, &f.t().dot(&vxx).dot(&f));
                qt.scaled_add(multiplier, &f.t().dot(&(&vx + &vxx.dot(&dynamics.fv_at(t)))));
            }
            linalg::symmetrize(&mut qtt);

            if linalg::has_nan(qtt.slice(s![u0..u1, u0..u1])) {
                warn!("NaN in action Hessian at t = {}; replacing with identity", t);
                qtt.slice_mut(s![u0..u1, u0..u1]).assign(&Array2::eye(du));
            }

            let quu = qtt.slice(s![u0..u1, u0..u1]).to_owned();
            let mut qux = qtt.slice(s![u0..u1, ..dx]).to_owned();
            let mut qu = qt.slice(s![u0..u1]).to_owned();
            if let Some(opponent) = &self.opponent {
                let quo = qtt.slice(s![u0..u1, opponent.block.clone()]);
                qux += &quo.dot(&opponent.policy.gain(t));
                qu += &quo.dot(&opponent.policy.bias(t));
            }

            let (inv_term, k_term, gain_term) = match self.config.constraint_mode {
                ConstraintMode::PerTrajectory => (quu, qu, qux),
                ConstraintMode::PerStep => {
                    let e = eta.at(t);
                    let prev_prc = self.prev.inv_covar(t);
                    (
                        &quu / e + &prev_prc,
                        &qu / e - &prev_prc.dot(&self.prev.bias(t)),
                        &qux / e - &prev_prc.dot(&self.prev.gain(t)),
                    )
                }
            };

            let chol_inv = match linalg::cholesky(&inv_term) {
                Ok(l) => l,
                Err(err) => {
                    debug!("t = {}: {}", t, err);
                    return Ok(Sweep::Failed { time_step: t });
                }
            };
            let mut covar = linalg::cho_inverse(chol_inv.view())?;
            linalg::symmetrize(&mut covar);
            let chol = match linalg::cholesky(&covar) {
                Ok(l) => l,
                Err(err) => {
                    debug!("t = {}: policy covariance: {}", t, err);
                    return Ok(Sweep::Failed { time_step: t });
                }
            };
            let gain = -linalg::cho_solve(chol_inv.view(), gain_term.view())?;
            let bias = -linalg::cho_solve_vec(chol_inv.view(), k_term.view())?;

            // Value function of the state under the new controller and any fixed opponent.
            let mut m = Array2::zeros((d, dx));
            let mut mv = Array1::zeros(d);
            m.slice_mut(s![..dx, ..]).assign(&Array2::eye(dx));
            m.slice_mut(s![u0..u1, ..]).assign(&gain);
            mv.slice_mut(s![u0..u1]).assign(&bias);
            if let Some(opponent) = &self.opponent {
                let block = opponent.block.clone();
                m.slice_mut(s![block.clone(), ..])
                    .assign(&opponent.policy.gain(t));
                mv.slice_mut(s![block]).assign(&opponent.policy.bias(t));
            }
            vxx = m.t().dot(&qtt).dot(&m);
            linalg::symmetrize(&mut vxx);
            vx = m.t().dot(&(&qt + &qtt.dot(&mv)));

            let step = PolicyStep {
                gain,
                bias,
                covar,
                chol,
                inv_covar: inv_term,
            };
            match &mut fresh {
                Some(policy) => policy.set_step(t, &step),
                None => staged.push((t, step)),
            }
        }

        let traj_distr = match fresh {
            Some(policy) => policy,
            None => {
                let mut policy = self.prev.clone();
                for (t, step) in &staged {
                    policy.set_step(*t, step);
                }
                policy
            }
        };
        Ok(Sweep::Complete(traj_distr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::LinearDynamics;
    use ndarray::{arr1, Array3};
    use nalgebra::SymmetricEigen;
    use rstest::rstest;

    fn double_integrator(horizon: usize) -> TrajectoryInfo {
        // x = [p, v]; p' = p + 0.1 v, v' = v + 0.1 u
        let fm = Array3::from_shape_fn((horizon, 2, 3), |(_, i, j)| match (i, j) {
            (0, 0) | (1, 1) => 1.0,
            (0, 1) | (1, 2) => 0.1,
            _ => 0.0,
        });
        let dynamics = LinearDynamics::new(
            fm,
            Array2::zeros((horizon, 2)),
            Array3::from_shape_fn((horizon, 2, 2), |(_, i, j)| if i == j { 0.01 } else { 0.0 }),
        )
        .unwrap();
        let cm = Array3::from_shape_fn((horizon, 3, 3), |(_, i, j)| match (i, j) {
            (0, 0) => 1.0,
            (1, 1) => 0.1,
            (2, 2) => 0.01,
            _ => 0.0,
        });
        TrajectoryInfo::new(dynamics, arr1(&[1.0, 0.0]), Array2::eye(2) * 0.01)
            .unwrap()
            .with_cost(Array1::zeros(horizon), Array2::zeros((horizon, 3)), cm)
            .unwrap()
    }

    fn config(mode: ConstraintMode, strategy: UpdateStrategy) -> TrajOptConfig {
        TrajOptConfig {
            constraint_mode: mode,
            update_strategy: strategy,
            ..TrajOptConfig::default()
        }
    }

    fn raw_costs(info: &TrajectoryInfo) -> impl Fn(&Eta) -> Result<QuadraticCost, TrajOptError> + '_ {
        move |_| Ok(info.quadratic_cost())
    }

    fn assert_pd(a: ndarray::ArrayView2<f64>) {
        let sym = (&a + &a.t()) * 0.5;
        let eig = SymmetricEigen::new(linalg::to_dmatrix(&sym));
        assert!(eig.eigenvalues.iter().all(|&l| l > 0.0), "{:?}", a);
    }

    #[rstest]
    #[case(ConstraintMode::PerTrajectory)]
    #[case(ConstraintMode::PerStep)]
    fn covariance_positive_definite(#[case] mode: ConstraintMode) {
        let info = double_integrator(5);
        let prev = LinearGaussianPolicy::zero_mean(5, 2, 1, 1.0);
        let config = config(mode, UpdateStrategy::default());
        let problem = LqrProblem::new(&config, &prev, &info, 2..3, None, None).unwrap();
        let pass = problem.backward(&Eta::scalar(1.0), &raw_costs(&info)).unwrap();
        assert_eq!(pass.retries, 0);
        for t in 0..5 {
            assert_pd(pass.traj_distr.covar(t));
            let l = pass.traj_distr.chol(t);
            let reconstructed = l.dot(&l.t());
            for (a, b) in reconstructed.iter().zip(pass.traj_distr.covar(t)) {
                assert!((a - b).abs() < 1e-10);
            }
            let id = pass.traj_distr.covar(t).dot(&pass.traj_distr.inv_covar(t));
            assert!((id[[0, 0]] - 1.0).abs() < 1e-10);
        }
    }

    #[rstest]
    #[case(ConstraintMode::PerTrajectory)]
    #[case(ConstraintMode::PerStep)]
    fn update_strategies_agree(#[case] mode: ConstraintMode) {
        let info = double_integrator(4);
        let prev = LinearGaussianPolicy::zero_mean(4, 2, 1, 2.0);
        let fresh_config = config(mode, UpdateStrategy::BuildFresh);
        let mutate_config = config(mode, UpdateStrategy::MutateExisting);
        let fresh = LqrProblem::new(&fresh_config, &prev, &info, 2..3, None, None)
            .unwrap()
            .backward(&Eta::scalar(0.5), &raw_costs(&info))
            .unwrap();
        let mutated = LqrProblem::new(&mutate_config, &prev, &info, 2..3, None, None)
            .unwrap()
            .backward(&Eta::scalar(0.5), &raw_costs(&info))
            .unwrap();
        assert_eq!(fresh, mutated);
    }

    #[test]
    fn matches_riccati_recursion() {
        // Scalar x' = x + u, cost ½ (x² + u²), no KL term: K_{T-1} = 0, K_{T-2} = -½.
        let horizon = 2;
        let dynamics = LinearDynamics::new(
            Array3::from_elem((horizon, 1, 2), 1.0),
            Array2::zeros((horizon, 1)),
            Array3::zeros((horizon, 1, 1)),
        )
        .unwrap();
        let cm = Array3::from_shape_fn((horizon, 2, 2), |(_, i, j)| if i == j { 1.0 } else { 0.0 });
        let info = TrajectoryInfo::new(dynamics, arr1(&[1.0]), Array2::eye(1))
            .unwrap()
            .with_cost(Array1::zeros(horizon), Array2::zeros((horizon, 2)), cm)
            .unwrap();
        let prev = LinearGaussianPolicy::zero_mean(horizon, 1, 1, 1.0);
        let config = TrajOptConfig::default();
        let problem = LqrProblem::new(&config, &prev, &info, 1..2, None, None).unwrap();
        let pass = problem.backward(&Eta::scalar(1.0), &raw_costs(&info)).unwrap();
        let gains = pass.traj_distr.gains();
        assert!(gains[[1, 0, 0]].abs() < 1e-12);
        assert!((gains[[0, 0, 0]] + 0.5).abs() < 1e-12);
        // Quu = 1 + Vxx = 2 at t = 0
        assert!((pass.traj_distr.covar(0)[[0, 0]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn nan_dynamics_rejected() {
        let mut info = double_integrator(3);
        info.dynamics = LinearDynamics::new(
            Array3::from_elem((3, 2, 3), f64::NAN),
            Array2::zeros((3, 2)),
            Array3::zeros((3, 2, 2)),
        )
        .unwrap();
        let prev = LinearGaussianPolicy::zero_mean(3, 2, 1, 1.0);
        let config = TrajOptConfig::default();
        let result = LqrProblem::new(&config, &prev, &info, 2..3, None, None);
        assert!(matches!(result, Err(TrajOptError::NanDynamics)));
    }

    #[test]
    fn nan_action_hessian_replaced() {
        let mut info = double_integrator(2);
        info.cm[[1, 2, 2]] = f64::NAN;
        let prev = LinearGaussianPolicy::zero_mean(2, 2, 1, 1.0);
        let config = TrajOptConfig::default();
        let problem = LqrProblem::new(&config, &prev, &info, 2..3, None, None).unwrap();
        let pass = problem.backward(&Eta::scalar(1.0), &raw_costs(&info)).unwrap();
        assert!((pass.traj_distr.covar(1)[[0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn retries_increase_eta() {
        // Non-PD action cost fixed by a large enough KL weight: (Cuu + eta) / eta > 0 iff eta > 2
        let info = double_integrator(1);
        let prev = LinearGaussianPolicy::zero_mean(1, 2, 1, 1.0);
        let config = TrajOptConfig::default();
        let problem = LqrProblem::new(&config, &prev, &info, 2..3, None, None).unwrap();
        let costs = |eta: &Eta| -> Result<QuadraticCost, TrajOptError> {
            let e = eta.at(0);
            let mut cost = info.quadratic_cost();
            cost.cm[[0, 2, 2]] = (-2.0 + e) / e;
            Ok(cost)
        };
        let pass = problem.backward(&Eta::scalar(1.0), &costs).unwrap();
        assert!(pass.retries >= 1);
        assert!(pass.eta.at(0) > 2.0);
        assert!(pass.eta.at(0) < 3.0);
    }

    #[test]
    fn permanently_indefinite_fails() {
        let mut info = double_integrator(2);
        info.cm.slice_mut(s![.., 2, 2]).fill(-1.0);
        let prev = LinearGaussianPolicy::zero_mean(2, 2, 1, 1.0);
        let config = TrajOptConfig::default();
        let problem = LqrProblem::new(&config, &prev, &info, 2..3, None, None).unwrap();
        let result = problem.backward(&Eta::scalar(1.0), &raw_costs(&info));
        assert!(matches!(
            result,
            Err(TrajOptError::IllConditioned {
                time_step: Some(1),
                ..
            })
        ));
    }

    #[test]
    fn per_step_failure_at_first_step_retries() {
        // Only t = 0 is indefinite; per-step regularization fixes it by raising eta[0].
        let mut info = double_integrator(3);
        info.cm[[0, 2, 2]] = -0.5;
        let prev = LinearGaussianPolicy::zero_mean(3, 2, 1, 1.0);
        let config = config(ConstraintMode::PerStep, UpdateStrategy::default());
        let problem = LqrProblem::new(&config, &prev, &info, 2..3, None, None).unwrap();
        // Quu / eta + 1 > 0 iff eta > 0.5 (ignoring the small value function term)
        let pass = problem.backward(&Eta::scalar(0.1), &raw_costs(&info)).unwrap();
        assert!(pass.retries >= 1);
        assert!(pass.eta.values()[0] > 0.1);
        assert_eq!(pass.eta.values()[1], 0.1);
        assert_eq!(pass.eta.values()[2], 0.1);
    }

    #[test]
    fn policy_weights_scale_value_function() {
        let info = double_integrator(3);
        let prev = LinearGaussianPolicy::zero_mean(3, 2, 1, 1.0);
        let config = TrajOptConfig::default();
        let unweighted = LqrProblem::new(&config, &prev, &info, 2..3, None, None)
            .unwrap()
            .backward(&Eta::scalar(1.0), &raw_costs(&info))
            .unwrap();
        // Constant weights: ratio 1 everywhere
        let weights = PolicyWeights::new(Array1::from_elem(3, 0.7));
        let weighted = LqrProblem::new(&config, &prev, &info, 2..3, None, Some(&weights))
            .unwrap()
            .backward(&Eta::scalar(1.0), &raw_costs(&info))
            .unwrap();
        assert_eq!(unweighted, weighted);

        let weights = PolicyWeights::new(arr1(&[1.0, 0.0, 0.0]));
        let discounted = LqrProblem::new(&config, &prev, &info, 2..3, None, Some(&weights))
            .unwrap()
            .backward(&Eta::scalar(1.0), &raw_costs(&info))
            .unwrap();
        // ratio (0 + 1) / (1 + 1) halves the future at t = 0
        assert!(discounted.traj_distr.covar(0)[[0, 0]] > unweighted.traj_distr.covar(0)[[0, 0]]);
    }
}
