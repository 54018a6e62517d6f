//! Protagonist / adversary policy pair
use super::{LinearGaussianPolicy, PolicyStep};
use crate::error::{check_shape, TrajOptError};
use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// A pair of linear-Gaussian policies acting on the same state.
///
/// The protagonist chooses `u` (dimension `dU`) and the adversary chooses `v`
/// (dimension `dV`). The joint policy over `[u; v]` treats the two actions as conditionally
/// independent given the state: its gains and biases are stacked and its covariance is block
/// diagonal. It is rebuilt whenever either side is replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustLinearGaussianPolicy {
    protagonist: LinearGaussianPolicy,
    adversary: LinearGaussianPolicy,
    joint: LinearGaussianPolicy,
}

impl RobustLinearGaussianPolicy {
    /// Pair two policies with matching horizon and state dimension.
    pub fn new(
        protagonist: LinearGaussianPolicy,
        adversary: LinearGaussianPolicy,
    ) -> Result<Self, TrajOptError> {
        check_shape(
            "adversary gains",
            &[protagonist.horizon(), adversary.du(), protagonist.dx()],
            adversary.gains().shape(),
        )?;
        let joint = join(&protagonist, &adversary);
        Ok(Self {
            protagonist,
            adversary,
            joint,
        })
    }

    pub const fn protagonist(&self) -> &LinearGaussianPolicy {
        &self.protagonist
    }

    pub const fn adversary(&self) -> &LinearGaussianPolicy {
        &self.adversary
    }

    /// Joint policy over `[u; v]`.
    pub const fn joint(&self) -> &LinearGaussianPolicy {
        &self.joint
    }

    pub fn horizon(&self) -> usize {
        self.protagonist.horizon()
    }

    pub fn dx(&self) -> usize {
        self.protagonist.dx()
    }

    /// Protagonist action dimension `dU`.
    pub fn du(&self) -> usize {
        self.protagonist.du()
    }

    /// Adversary action dimension `dV`.
    pub fn dv(&self) -> usize {
        self.adversary.du()
    }

    /// Replace the protagonist.
    #[must_use]
    pub fn with_protagonist(self, protagonist: LinearGaussianPolicy) -> Self {
        let joint = join(&protagonist, &self.adversary);
        Self {
            protagonist,
            adversary: self.adversary,
            joint,
        }
    }

    /// Replace the adversary.
    #[must_use]
    pub fn with_adversary(self, adversary: LinearGaussianPolicy) -> Self {
        let joint = join(&self.protagonist, &adversary);
        Self {
            protagonist: self.protagonist,
            adversary,
            joint,
        }
    }
}

fn join(
    protagonist: &LinearGaussianPolicy,
    adversary: &LinearGaussianPolicy,
) -> LinearGaussianPolicy {
    let horizon = protagonist.horizon();
    let dx = protagonist.dx();
    let (du, dv) = (protagonist.du(), adversary.du());
    let d = du + dv;

    let mut joint = LinearGaussianPolicy::zero_mean(horizon, dx, d, 1.0);
    for t in 0..horizon {
        let mut gain = Array2::zeros((d, dx));
        gain.slice_mut(s![..du, ..]).assign(&protagonist.gain(t));
        gain.slice_mut(s![du.., ..]).assign(&adversary.gain(t));

        let mut bias = Array1::zeros(d);
        bias.slice_mut(s![..du]).assign(&protagonist.bias(t));
        bias.slice_mut(s![du..]).assign(&adversary.bias(t));

        let block = |a: ArrayView2<f64>, b: ArrayView2<f64>| {
            let mut m = Array2::zeros((d, d));
            m.slice_mut(s![..du, ..du]).assign(&a);
            m.slice_mut(s![du.., du..]).assign(&b);
            m
        };
        joint.set_step(
            t,
            &PolicyStep {
                gain,
                bias,
                covar: block(protagonist.covar(t), adversary.covar(t)),
                chol: block(protagonist.chol(t), adversary.chol(t)),
                inv_covar: block(protagonist.inv_covar(t), adversary.inv_covar(t)),
            },
        );
    }
    joint
}
