//! KL divergence between trajectory distributions
use super::forward::Marginals;
use crate::error::{check_shape, TrajOptError};
use crate::linalg;
use crate::policy::LinearGaussianPolicy;
use ndarray::{s, Array1};

/// Per-time-step `KL(p_new || p_prev)` between the trajectory distributions of two controllers.
///
/// `marginals` are the state-action marginals of `new` under the dynamics. Each entry is
/// the divergence between the two action distributions, averaged over the state marginal,
/// and is clipped below at zero.
pub fn traj_distr_kl(
    marginals: &Marginals,
    new: &LinearGaussianPolicy,
    prev: &LinearGaussianPolicy,
) -> Result<Array1<f64>, TrajOptError> {
    check_compatible(marginals, new, prev)?;
    let kl = Array1::from_shape_fn(new.horizon(), |t| {
        let mu = marginals.mu_at(t);
        let sigma = marginals.sigma_at(t);
        let terms_new = new.divergence_terms(t);
        let terms_prev = prev.divergence_terms(t);
        let dm = &terms_new.m - &terms_prev.m;
        let dv = &terms_new.v - &terms_prev.v;
        let dc = terms_new.c - terms_prev.c;

        let logdet_new = linalg::cho_logdet(new.chol(t));
        let logdet_prev = linalg::cho_logdet(prev.chol(t));

        let kl_t = -0.5 * mu.dot(&dm.dot(&mu)) - mu.dot(&dv) - dc - 0.5 * (&sigma * &dm).sum()
            - 0.5 * logdet_new
            + 0.5 * logdet_prev;
        kl_t.max(0.0)
    });
    Ok(kl)
}

/// Per-time-step `KL(π_new || π_prev)` averaged over the state marginals of the previous
/// controller.
///
/// `marginals` are the state-action marginals of `prev`; only their state block is used.
pub fn traj_distr_kl_alt(
    marginals: &Marginals,
    new: &LinearGaussianPolicy,
    prev: &LinearGaussianPolicy,
) -> Result<Array1<f64>, TrajOptError> {
    check_compatible(marginals, new, prev)?;
    let (dx, du) = (new.dx(), new.du());
    #[allow(clippy::cast_precision_loss)]
    let du_f = du as f64;
    let kl = Array1::from_shape_fn(new.horizon(), |t| {
        let mu_x = marginals.mu_at(t).slice_move(s![..dx]);
        let sigma_x = marginals.sigma_at(t).slice_move(s![..dx, ..dx]);

        let prc_prev = prev.inv_covar(t);
        let gain_diff = &prev.gain(t) - &new.gain(t);
        let bias_diff = &prev.bias(t) - &new.bias(t);

        let logdet_new = linalg::cho_logdet(new.chol(t));
        let logdet_prev = linalg::cho_logdet(prev.chol(t));

        let prc_gain_diff = prc_prev.dot(&gain_diff);
        let gain_quad = gain_diff.t().dot(&prc_gain_diff);
        let shift = gain_diff.dot(&mu_x);

        let kl_t = 0.5
            * (logdet_prev - logdet_new - du_f
                + (&prc_prev * &new.covar(t).t()).sum()
                + bias_diff.dot(&prc_prev.dot(&bias_diff))
                + mu_x.dot(&gain_quad.dot(&mu_x))
                + (&gain_quad * &sigma_x.t()).sum()
                + 2.0 * bias_diff.dot(&prc_prev.dot(&shift)));
        kl_t.max(0.0)
    });
    Ok(kl)
}

fn check_compatible(
    marginals: &Marginals,
    new: &LinearGaussianPolicy,
    prev: &LinearGaussianPolicy,
) -> Result<(), TrajOptError> {
    let (horizon, dx, du) = (new.horizon(), new.dx(), new.du());
    check_shape("previous gains", &[horizon, du, dx], prev.gains().shape())?;
    check_shape("marginal means", &[horizon, dx + du], marginals.mu.shape())?;
    Ok(())
}
