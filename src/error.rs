//! Error types
use thiserror::Error;

/// Failure of a dense linear algebra routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinalgError {
    #[error("matrix is not symmetric positive definite")]
    NotPositiveDefinite,
    #[error("matrix is singular")]
    Singular,
    #[error("expected a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

/// Error from trajectory optimization.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrajOptError {
    #[error("NaNs encountered in dynamics")]
    NanDynamics,
    #[error(
        "failed to find a positive definite solution even for eta = {eta:e}{} \
         (check that dynamics and cost are reasonably well conditioned)",
        .time_step.map(|t| format!(" at time step {}", t)).unwrap_or_default()
    )]
    IllConditioned {
        eta: f64,
        time_step: Option<usize>,
    },
    #[error("{name} has shape {actual:?}, expected {expected:?}")]
    Shape {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("eta has length {actual}, expected 1 or {horizon}")]
    EtaLength { actual: usize, horizon: usize },
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

impl TrajOptError {
    /// Shape mismatch error for an array named `name`.
    pub fn shape(name: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::Shape {
            name,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Check that an array has the expected shape.
pub(crate) fn check_shape(
    name: &'static str,
    expected: &[usize],
    actual: &[usize],
) -> Result<(), TrajOptError> {
    if expected == actual {
        Ok(())
    } else {
        Err(TrajOptError::shape(name, expected, actual))
    }
}
