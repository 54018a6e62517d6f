//! Gaussian fits of sampled trajectories
use crate::error::{check_shape, TrajOptError};
use crate::linalg;
use ndarray::{
    s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis,
};

/// Action covariance of a linearized policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyCovariance<'a> {
    /// One covariance per time step, shared by every sample: `(T, dU, dU)`.
    Shared(ArrayView3<'a, f64>),
    /// One covariance per sample and time step: `(N, T, dU, dU)`.
    PerSample(ArrayView4<'a, f64>),
}

impl<'a> PolicyCovariance<'a> {
    fn at(&self, n: usize, t: usize) -> ArrayView2<'_, f64> {
        match self {
            Self::Shared(covar) => covar.index_axis(Axis(0), t),
            Self::PerSample(covar) => covar.slice(s![n, t, .., ..]),
        }
    }
}

/// Moments of `[x; u]` under a linearized policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    /// Mean over samples, `(T, dX + dU)`.
    pub mean: Array2<f64>,
    /// Per-sample second moments, `(N, T, dX + dU, dX + dU)`.
    pub second: Array4<f64>,
}

/// Estimate the moments of states `x` (N, T, dX) joined with policy means `mu` (N, T, dU).
///
/// The second moment of each sample is `z zᵀ` with the policy covariance added to the
/// action block.
pub fn estimate_moments(
    x: ArrayView3<f64>,
    mu: ArrayView3<f64>,
    covar: PolicyCovariance,
) -> Result<Moments, TrajOptError> {
    let (n, horizon, dx) = x.dim();
    let du = mu.len_of(Axis(2));
    check_shape("mu", &[n, horizon, du], mu.shape())?;
    match covar {
        PolicyCovariance::Shared(c) => check_shape("covar", &[horizon, du, du], c.shape())?,
        PolicyCovariance::PerSample(c) => {
            check_shape("covar", &[n, horizon, du, du], c.shape())?;
        }
    }

    let d = dx + du;
    let mut joined = Array3::zeros((n, horizon, d));
    joined.slice_mut(s![.., .., ..dx]).assign(&x);
    joined.slice_mut(s![.., .., dx..]).assign(&mu);
    let mean = joined
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array2::from_elem((horizon, d), f64::NAN));

    let mut second = Array4::zeros((n, horizon, d, d));
    for i in 0..n {
        for t in 0..horizon {
            let z = joined.slice(s![i, t, ..]);
            let mut em = second.slice_mut(s![i, t, .., ..]);
            em.assign(&linalg::outer(z, z));
            let mut action_block = em.slice_mut(s![dx.., dx..]);
            action_block += &covar.at(i, t);
        }
    }
    Ok(Moments { mean, second })
}

/// Normal-inverse-Wishart prior on a joint Gaussian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NiwPrior<'a> {
    pub mu0: ArrayView1<'a, f64>,
    pub phi: ArrayView2<'a, f64>,
    /// Strength of the prior mean.
    pub m: f64,
    /// Strength of the prior covariance.
    pub n0: f64,
}

/// Linear-Gaussian conditional `y | x ~ N(fd x + fc, dynsig)`.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianFit {
    pub fd: Array2<f64>,
    pub fc: Array1<f64>,
    pub dynsig: Array2<f64>,
}

/// MAP fit of a joint Gaussian over `[x; y]` points, conditioned on `x`.
///
/// `pts` is `(N, dX + dY)` with one weight per point in `dwts`. The weighted empirical
/// moments are combined with `prior`, `sig_reg` is added to the joint covariance, and the
/// trailing `dY` block is conditioned on the leading `dX` block.
///
/// # Errors
/// [`crate::error::LinalgError::Singular`] if the state block of the covariance is singular.
pub fn gauss_fit_joint_prior(
    pts: ArrayView2<f64>,
    prior: &NiwPrior,
    dwts: ArrayView1<f64>,
    dx: usize,
    dy: usize,
    sig_reg: ArrayView2<f64>,
) -> Result<GaussianFit, TrajOptError> {
    let n = dwts.len();
    let d = dx + dy;
    check_shape("pts", &[n, d], pts.shape())?;
    check_shape("mu0", &[d], prior.mu0.shape())?;
    check_shape("phi", &[d, d], prior.phi.shape())?;
    check_shape("sig_reg", &[d, d], sig_reg.shape())?;

    let mean = pts.t().dot(&dwts);
    let diff = &pts - &mean;
    let weighted = &diff * &dwts.insert_axis(Axis(1));
    let mut empsig = diff.t().dot(&weighted);
    linalg::symmetrize(&mut empsig);

    #[allow(clippy::cast_precision_loss)]
    let n = n as f64;
    let offset = &mean - &prior.mu0;
    let mut sigma = (&empsig * n
        + &prior.phi
        + &linalg::outer(offset.view(), offset.view()) * (n * prior.m / (n + prior.m)))
        / (n + prior.n0);
    linalg::symmetrize(&mut sigma);
    sigma += &sig_reg;

    let sigma_xx = sigma.slice(s![..dx, ..dx]);
    let sigma_xy = sigma.slice(s![..dx, dx..]);
    let fd = linalg::solve(sigma_xx, sigma_xy)?.reversed_axes();
    let fc = &mean.slice(s![dx..]) - &fd.dot(&mean.slice(s![..dx]));
    let mut dynsig = &sigma.slice(s![dx.., dx..]) - &fd.dot(&sigma_xx).dot(&fd.t());
    linalg::symmetrize(&mut dynsig);
    Ok(GaussianFit { fd, fc, dynsig })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinalgError;
    use ndarray::{arr1, arr2, Array4};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    /// Points on the plane `y = 2 x0 - x1 + 0.5`.
    fn plane() -> Array2<f64> {
        let xs = [[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [-1.0, 2.0], [2.0, -1.0]];
        Array2::from_shape_fn((xs.len(), 3), |(i, j)| {
            if j < 2 {
                xs[i][j]
            } else {
                2.0 * xs[i][0] - xs[i][1] + 0.5
            }
        })
    }

    fn flat_prior<'a>(mu0: &'a Array1<f64>, phi: &'a Array2<f64>) -> NiwPrior<'a> {
        NiwPrior {
            mu0: mu0.view(),
            phi: phi.view(),
            m: 0.0,
            n0: 0.0,
        }
    }

    #[test]
    fn recovers_exact_linear_relation() {
        let pts = plane();
        let mu0 = Array1::zeros(3);
        let phi = Array2::zeros((3, 3));
        let dwts = Array1::from_elem(5, 0.2);
        let sig_reg = Array2::zeros((3, 3));
        let fit = gauss_fit_joint_prior(
            pts.view(),
            &flat_prior(&mu0, &phi),
            dwts.view(),
            2,
            1,
            sig_reg.view(),
        )
        .unwrap();
        assert!((fit.fd[[0, 0]] - 2.0).abs() < 1e-10);
        assert!((fit.fd[[0, 1]] + 1.0).abs() < 1e-10);
        assert!((fit.fc[0] - 0.5).abs() < 1e-10);
        assert!(fit.dynsig[[0, 0]].abs() < 1e-10);
    }

    #[test]
    fn recovers_noisy_linear_gaussian() {
        // y = A x + b + L e with x, e ~ N(0, I)
        let a = arr2(&[[1.0, 0.5], [-0.3, 2.0]]);
        let b = arr1(&[0.2, -1.0]);
        let l = arr2(&[[0.2, 0.0], [0.1, 0.3]]);
        let noise_covar = l.dot(&l.t());

        let n = 5000;
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut pts = Array2::zeros((n, 4));
        for mut row in pts.outer_iter_mut() {
            let x = Array1::from_shape_fn(2, |_| normal.sample(&mut rng));
            let e = Array1::from_shape_fn(2, |_| normal.sample(&mut rng));
            let y = a.dot(&x) + &b + l.dot(&e);
            row.slice_mut(s![..2]).assign(&x);
            row.slice_mut(s![2..]).assign(&y);
        }

        let mu0 = Array1::zeros(4);
        let phi = Array2::zeros((4, 4));
        #[allow(clippy::cast_precision_loss)]
        let dwts = Array1::from_elem(n, 1.0 / n as f64);
        let sig_reg = Array2::zeros((4, 4));
        let fit = gauss_fit_joint_prior(
            pts.view(),
            &flat_prior(&mu0, &phi),
            dwts.view(),
            2,
            2,
            sig_reg.view(),
        )
        .unwrap();

        for ((i, j), &value) in fit.fd.indexed_iter() {
            assert!((value - a[[i, j]]).abs() < 0.05, "fd {:?}: {}", (i, j), value);
        }
        for (i, &value) in fit.fc.indexed_iter() {
            assert!((value - b[i]).abs() < 0.05, "fc {}: {}", i, value);
        }
        for ((i, j), &value) in fit.dynsig.indexed_iter() {
            assert!(
                (value - noise_covar[[i, j]]).abs() < 0.01,
                "dynsig {:?}: {}",
                (i, j),
                value
            );
        }
    }

    #[test]
    fn prior_adds_residual_covariance() {
        let pts = plane();
        let mu0 = Array1::zeros(3);
        let phi = Array2::eye(3);
        let prior = NiwPrior {
            mu0: mu0.view(),
            phi: phi.view(),
            m: 1.0,
            n0: 1.0,
        };
        let dwts = Array1::from_elem(5, 0.2);
        let sig_reg = Array2::eye(3) * 1e-6;
        let fit =
            gauss_fit_joint_prior(pts.view(), &prior, dwts.view(), 2, 1, sig_reg.view()).unwrap();
        assert!(fit.dynsig[[0, 0]] > 0.0);
    }

    #[test]
    fn singular_state_block() {
        let pts = arr2(&[[1.0, 2.0], [1.0, 3.0]]);
        let mu0 = Array1::zeros(2);
        let phi = Array2::zeros((2, 2));
        let dwts = arr1(&[0.5, 0.5]);
        let sig_reg = Array2::zeros((2, 2));
        let result = gauss_fit_joint_prior(
            pts.view(),
            &flat_prior(&mu0, &phi),
            dwts.view(),
            1,
            1,
            sig_reg.view(),
        );
        assert_eq!(
            result,
            Err(TrajOptError::Linalg(LinalgError::Singular))
        );
    }

    #[test]
    fn rejects_mismatched_weights() {
        let pts = plane();
        let mu0 = Array1::zeros(3);
        let phi = Array2::zeros((3, 3));
        let dwts = Array1::from_elem(4, 0.25);
        let sig_reg = Array2::zeros((3, 3));
        let result = gauss_fit_joint_prior(
            pts.view(),
            &flat_prior(&mu0, &phi),
            dwts.view(),
            2,
            1,
            sig_reg.view(),
        );
        assert!(matches!(result, Err(TrajOptError::Shape { name: "pts", .. })));
    }

    #[test]
    fn moments_pad_action_block() {
        // N = 2, T = 1, dX = 1, dU = 1
        let x = Array3::from_shape_vec((2, 1, 1), vec![1.0, 3.0]).unwrap();
        let mu = Array3::from_shape_vec((2, 1, 1), vec![0.0, 2.0]).unwrap();
        let covar = Array3::from_elem((1, 1, 1), 0.5);
        let moments =
            estimate_moments(x.view(), mu.view(), PolicyCovariance::Shared(covar.view())).unwrap();
        assert_eq!(moments.mean, arr2(&[[2.0, 1.0]]));
        assert_eq!(
            moments.second.slice(s![1, 0, .., ..]),
            arr2(&[[9.0, 6.0], [6.0, 4.5]])
        );
        assert_eq!(
            moments.second.slice(s![0, 0, .., ..]),
            arr2(&[[1.0, 0.0], [0.0, 0.5]])
        );
    }

    #[test]
    fn shared_and_per_sample_covariance_agree() {
        let x = Array3::from_shape_fn((3, 2, 2), |(n, t, i)| (n + t + i) as f64);
        let mu = Array3::from_shape_fn((3, 2, 1), |(n, t, _)| n as f64 - t as f64);
        let shared = Array3::from_shape_fn((2, 1, 1), |(t, _, _)| 0.1 * (t + 1) as f64);
        let per_sample = Array4::from_shape_fn((3, 2, 1, 1), |(_, t, _, _)| 0.1 * (t + 1) as f64);
        let a = estimate_moments(x.view(), mu.view(), PolicyCovariance::Shared(shared.view()))
            .unwrap();
        let b = estimate_moments(
            x.view(),
            mu.view(),
            PolicyCovariance::PerSample(per_sample.view()),
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
