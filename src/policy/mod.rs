//! Linear-Gaussian controllers
mod lin_gauss;
mod robust;

pub use lin_gauss::{DivergenceTerms, LinearGaussianPolicy, PolicyStep};
pub use robust::RobustLinearGaussianPolicy;
