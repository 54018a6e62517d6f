//! Time-varying linear-Gaussian policy
use crate::error::{check_shape, TrajOptError};
use crate::linalg;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// A time-varying linear-Gaussian policy `π(u_t | x_t) = N(K_t x_t + k_t, Σ_t)`.
///
/// The covariance is stored three ways: `Σ_t`, its lower Cholesky factor `L_t` with
/// `Σ_t = L_t L_tᵀ`, and the precision `Σ_t⁻¹`. All three are kept consistent;
/// the only way to change a time step is to replace all of them together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearGaussianPolicy {
    /// Feedback gains `K`. Shape `(T, dU, dX)`.
    gains: Array3<f64>,
    /// Bias terms `k`. Shape `(T, dU)`.
    biases: Array2<f64>,
    /// Action covariance `Σ`. Shape `(T, dU, dU)`.
    pol_covar: Array3<f64>,
    /// Lower Cholesky factor of `Σ`. Shape `(T, dU, dU)`.
    chol_pol_covar: Array3<f64>,
    /// Precision `Σ⁻¹`. Shape `(T, dU, dU)`.
    inv_pol_covar: Array3<f64>,
}

/// The parameters of a policy at a single time step.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStep {
    pub gain: Array2<f64>,
    pub bias: Array1<f64>,
    pub covar: Array2<f64>,
    pub chol: Array2<f64>,
    pub inv_covar: Array2<f64>,
}

/// Quadratic form of `-log π(u | x)` over the joint vector `z = [x; u]`, up to the log
/// normalizer: `½ zᵀ M z + vᵀ z + c`.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceTerms {
    pub m: Array2<f64>,
    pub v: Array1<f64>,
    pub c: f64,
}

impl LinearGaussianPolicy {
    /// Create a policy from all of its parameters.
    ///
    /// The covariance representations are assumed to be consistent;
    /// only the shapes are checked.
    pub fn new(
        gains: Array3<f64>,
        biases: Array2<f64>,
        pol_covar: Array3<f64>,
        chol_pol_covar: Array3<f64>,
        inv_pol_covar: Array3<f64>,
    ) -> Result<Self, TrajOptError> {
        let (horizon, du, _) = gains.dim();
        check_shape("biases", &[horizon, du], biases.shape())?;
        check_shape("pol_covar", &[horizon, du, du], pol_covar.shape())?;
        check_shape("chol_pol_covar", &[horizon, du, du], chol_pol_covar.shape())?;
        check_shape("inv_pol_covar", &[horizon, du, du], inv_pol_covar.shape())?;
        Ok(Self {
            gains,
            biases,
            pol_covar,
            chol_pol_covar,
            inv_pol_covar,
        })
    }

    /// Create a policy from gains, biases and covariances.
    ///
    /// # Errors
    /// If any covariance is not symmetric positive definite.
    pub fn from_covariance(
        gains: Array3<f64>,
        biases: Array2<f64>,
        pol_covar: Array3<f64>,
    ) -> Result<Self, TrajOptError> {
        let mut chol = Array3::zeros(pol_covar.raw_dim());
        let mut inv = Array3::zeros(pol_covar.raw_dim());
        for (t, covar) in pol_covar.outer_iter().enumerate() {
            let l = linalg::cholesky(&covar)?;
            inv.index_axis_mut(Axis(0), t)
                .assign(&linalg::cho_inverse(l.view())?);
            chol.index_axis_mut(Axis(0), t).assign(&l);
        }
        Self::new(gains, biases, pol_covar, chol, inv)
    }

    /// Create a policy from gains, biases and lower Cholesky factors of the covariance.
    ///
    /// This is how a policy linearization is turned into a trajectory distribution.
    pub fn from_chol(
        gains: Array3<f64>,
        biases: Array2<f64>,
        chol_pol_covar: Array3<f64>,
    ) -> Result<Self, TrajOptError> {
        let mut covar = Array3::zeros(chol_pol_covar.raw_dim());
        let mut inv = Array3::zeros(chol_pol_covar.raw_dim());
        for (t, l) in chol_pol_covar.outer_iter().enumerate() {
            covar.index_axis_mut(Axis(0), t).assign(&l.dot(&l.t()));
            inv.index_axis_mut(Axis(0), t)
                .assign(&linalg::cho_inverse(l)?);
        }
        Self::new(gains, biases, covar, chol_pol_covar, inv)
    }

    /// A zero-mean policy with isotropic action noise of the given variance.
    pub fn zero_mean(horizon: usize, dx: usize, du: usize, variance: f64) -> Self {
        let eye = Array2::<f64>::eye(du);
        let stack = |m: Array2<f64>| {
            m.insert_axis(Axis(0))
                .broadcast((horizon, du, du))
                .map_or_else(|| Array3::zeros((horizon, du, du)), |b| b.to_owned())
        };
        Self {
            gains: Array3::zeros((horizon, du, dx)),
            biases: Array2::zeros((horizon, du)),
            pol_covar: stack(&eye * variance),
            chol_pol_covar: stack(&eye * variance.sqrt()),
            inv_pol_covar: stack(&eye / variance),
        }
    }

    /// A policy of the same shape with every entry set to NaN.
    ///
    /// Used as a blank to be filled in one time step at a time.
    #[must_use]
    pub fn nans_like(&self) -> Self {
        Self {
            gains: Array3::from_elem(self.gains.raw_dim(), f64::NAN),
            biases: Array2::from_elem(self.biases.raw_dim(), f64::NAN),
            pol_covar: Array3::from_elem(self.pol_covar.raw_dim(), f64::NAN),
            chol_pol_covar: Array3::from_elem(self.chol_pol_covar.raw_dim(), f64::NAN),
            inv_pol_covar: Array3::from_elem(self.inv_pol_covar.raw_dim(), f64::NAN),
        }
    }

    /// Horizon length `T`.
    pub fn horizon(&self) -> usize {
        self.gains.dim().0
    }

    /// Action dimension.
    pub fn du(&self) -> usize {
        self.gains.dim().1
    }

    /// State dimension.
    pub fn dx(&self) -> usize {
        self.gains.dim().2
    }

    pub const fn gains(&self) -> &Array3<f64> {
        &self.gains
    }

    pub const fn biases(&self) -> &Array2<f64> {
        &self.biases
    }

    pub const fn pol_covar(&self) -> &Array3<f64> {
        &self.pol_covar
    }

    pub const fn chol_pol_covar(&self) -> &Array3<f64> {
        &self.chol_pol_covar
    }

    pub const fn inv_pol_covar(&self) -> &Array3<f64> {
        &self.inv_pol_covar
    }

    /// Gain `K_t`.
    pub fn gain(&self, t: usize) -> ArrayView2<f64> {
        self.gains.index_axis(Axis(0), t)
    }

    /// Bias `k_t`.
    pub fn bias(&self, t: usize) -> ArrayView1<f64> {
        self.biases.index_axis(Axis(0), t)
    }

    /// Covariance `Σ_t`.
    pub fn covar(&self, t: usize) -> ArrayView2<f64> {
        self.pol_covar.index_axis(Axis(0), t)
    }

    /// Lower Cholesky factor of `Σ_t`.
    pub fn chol(&self, t: usize) -> ArrayView2<f64> {
        self.chol_pol_covar.index_axis(Axis(0), t)
    }

    /// Precision `Σ_t⁻¹`.
    pub fn inv_covar(&self, t: usize) -> ArrayView2<f64> {
        self.inv_pol_covar.index_axis(Axis(0), t)
    }

    /// Replace all parameters at time step `t`.
    pub(crate) fn set_step(&mut self, t: usize, step: &PolicyStep) {
        self.gains.index_axis_mut(Axis(0), t).assign(&step.gain);
        self.biases.index_axis_mut(Axis(0), t).assign(&step.bias);
        self.pol_covar.index_axis_mut(Axis(0), t).assign(&step.covar);
        self.chol_pol_covar
            .index_axis_mut(Axis(0), t)
            .assign(&step.chol);
        self.inv_pol_covar
            .index_axis_mut(Axis(0), t)
            .assign(&step.inv_covar);
    }

    /// Action for state `x` at time `t` given standard normal noise.
    ///
    /// `u = K_t x + k_t + L_t ε`
    pub fn act(&self, t: usize, x: ArrayView1<f64>, noise: ArrayView1<f64>) -> Array1<f64> {
        self.gain(t).dot(&x) + self.bias(t) + self.chol(t).dot(&noise)
    }

    /// Sample an action for state `x` at time `t`.
    pub fn sample_action<R: Rng + ?Sized>(
        &self,
        t: usize,
        x: ArrayView1<f64>,
        rng: &mut R,
    ) -> Array1<f64> {
        let noise: Array1<f64> = (0..self.du()).map(|_| rng.sample(StandardNormal)).collect();
        self.act(t, x, noise.view())
    }

    /// Terms of `-log π(u | x)` at time `t` as a quadratic in `[x; u]`.
    pub fn divergence_terms(&self, t: usize) -> DivergenceTerms {
        let (dx, du) = (self.dx(), self.du());
        let gain = self.gain(t);
        let bias = self.bias(t);
        let prc = self.inv_covar(t);

        let prc_gain = prc.dot(&gain);
        let prc_bias = prc.dot(&bias);

        let mut m = Array2::zeros((dx + du, dx + du));
        m.slice_mut(s![..dx, ..dx]).assign(&gain.t().dot(&prc_gain));
        m.slice_mut(s![..dx, dx..]).assign(&(-&gain.t().dot(&prc)));
        m.slice_mut(s![dx.., ..dx]).assign(&(-&prc_gain));
        m.slice_mut(s![dx.., dx..]).assign(&prc);

        let mut v = Array1::zeros(dx + du);
        v.slice_mut(s![..dx]).assign(&gain.t().dot(&prc_bias));
        v.slice_mut(s![dx..]).assign(&(-&prc_bias));

        let c = 0.5 * bias.dot(&prc_bias);
        DivergenceTerms { m, v, c }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::{fixture, rstest};

    #[fixture]
    fn policy() -> LinearGaussianPolicy {
        let gains = Array::from_shape_vec((2, 1, 2), vec![-1.0, 0.5, 0.0, -2.0]).unwrap();
        let biases = arr2(&[[0.1], [-0.2]]);
        let covar = Array::from_shape_vec((2, 1, 1), vec![4.0, 0.25]).unwrap();
        LinearGaussianPolicy::from_covariance(gains, biases, covar).unwrap()
    }

    #[rstest]
    fn dims(policy: LinearGaussianPolicy) {
        assert_eq!(policy.horizon(), 2);
        assert_eq!(policy.du(), 1);
        assert_eq!(policy.dx(), 2);
    }

    #[rstest]
    fn covariance_representations_consistent(policy: LinearGaussianPolicy) {
        for t in 0..policy.horizon() {
            let l = policy.chol(t);
            let sigma = l.dot(&l.t());
            assert!((sigma[[0, 0]] - policy.covar(t)[[0, 0]]).abs() < 1e-12);
            let id = policy.covar(t).dot(&policy.inv_covar(t));
            assert!((id[[0, 0]] - 1.0).abs() < 1e-12);
        }
    }

    #[rstest]
    fn from_chol_matches_from_covariance(policy: LinearGaussianPolicy) {
        let rebuilt = LinearGaussianPolicy::from_chol(
            policy.gains().clone(),
            policy.biases().clone(),
            policy.chol_pol_covar().clone(),
        )
        .unwrap();
        for (a, b) in rebuilt.inv_pol_covar().iter().zip(policy.inv_pol_covar()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[rstest]
    fn nans_like_same_shape(policy: LinearGaussianPolicy) {
        let blank = policy.nans_like();
        assert_eq!(blank.gains().dim(), policy.gains().dim());
        assert!(blank.pol_covar().iter().all(|x| x.is_nan()));
    }

    #[rstest]
    fn act_is_affine(policy: LinearGaussianPolicy) {
        let u = policy.act(0, arr1(&[1.0, 2.0]).view(), arr1(&[0.5]).view());
        // -1 + 1 + 0.1 + 2 * 0.5
        assert!((u[0] - 1.1).abs() < 1e-12);
    }

    #[rstest]
    fn sample_action_mean(policy: LinearGaussianPolicy) {
        let mut rng = StdRng::seed_from_u64(0);
        let x = arr1(&[1.0, 1.0]);
        let n = 20_000;
        let mean = (0..n)
            .map(|_| policy.sample_action(1, x.view(), &mut rng)[0])
            .sum::<f64>()
            / f64::from(n);
        // -2 - 0.2
        assert!((mean + 2.2).abs() < 0.02, "mean = {}", mean);
    }

    #[rstest]
    fn divergence_terms_match_log_prob(policy: LinearGaussianPolicy) {
        let t = 0;
        let terms = policy.divergence_terms(t);
        let x = arr1(&[0.3, -0.7]);
        let u = arr1(&[1.5]);
        let z = ndarray::concatenate![Axis(0), x, u];
        let quad = 0.5 * z.dot(&terms.m.dot(&z)) + terms.v.dot(&z) + terms.c;

        let residual = &u - &(policy.gain(t).dot(&x) + policy.bias(t));
        let expected = 0.5 * residual.dot(&policy.inv_covar(t).dot(&residual));
        assert!((quad - expected).abs() < 1e-12);
    }

    #[test]
    fn zero_mean_policy() {
        let policy = LinearGaussianPolicy::zero_mean(3, 2, 2, 4.0);
        assert_eq!(policy.covar(2), Array2::<f64>::eye(2) * 4.0);
        assert_eq!(policy.chol(1), Array2::<f64>::eye(2) * 2.0);
        assert_eq!(policy.inv_covar(0), Array2::<f64>::eye(2) * 0.25);
    }

    #[test]
    fn new_rejects_bad_shape() {
        let result = LinearGaussianPolicy::new(
            Array3::zeros((2, 1, 2)),
            Array2::zeros((3, 1)),
            Array3::zeros((2, 1, 1)),
            Array3::zeros((2, 1, 1)),
            Array3::zeros((2, 1, 1)),
        );
        assert!(matches!(result, Err(TrajOptError::Shape { name: "biases", .. })));
    }

    #[test]
    fn from_covariance_rejects_indefinite() {
        let result = LinearGaussianPolicy::from_covariance(
            Array3::zeros((1, 1, 1)),
            Array2::zeros((1, 1)),
            Array3::from_elem((1, 1, 1), -1.0),
        );
        assert!(result.is_err());
    }
}
