//! Trust-region LQR trajectory optimization for guided policy search.
//!
//! Local time-varying linear-Gaussian controllers are improved under a KL divergence
//! constraint to the previous controller, either alone or as a protagonist / adversary pair
//! playing a zero-sum game.
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::missing_const_for_fn)] // has some false positives
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::redundant_closure_for_method_calls)]
#![warn(clippy::use_self)]
pub mod algorithm;
pub mod dynamics;
mod error;
pub mod gaussian;
pub mod linalg;
pub mod logging;
pub mod policy;
pub mod traj_opt;

pub use algorithm::{
    Algorithm, AlgorithmConfig, IterationData, RobustAlgorithm, RobustIterationData,
    RobustTrajOptAlgorithm, TrajOptAlgorithm, TrajectoryInfo,
};
pub use dynamics::LinearDynamics;
pub use error::{LinalgError, TrajOptError};
pub use policy::{LinearGaussianPolicy, RobustLinearGaussianPolicy};
pub use traj_opt::{ConstraintMode, Eta, TrajOptConfig, TrajOptLqr, TrajOptUpdate};
