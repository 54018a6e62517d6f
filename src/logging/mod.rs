//! Logging statistics from optimization runs
//!
//! Diagnostics (soft failures, retries) go through the [`log`] crate macros.
//! Numeric per-iteration statistics go through a [`StatsLogger`].
mod display;
mod memory;

pub use display::DisplayLogger;
pub use memory::MemoryLogger;

use thiserror::Error;

/// A value that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum Loggable {
    /// Nothing. No data to log.
    /// Logging Nothing data may still produce a placeholder entry for the name.
    Nothing,
    /// A scalar value. Aggregate by taking means.
    Scalar(f64),
    /// A vector of values, such as a per-time-step dual variable.
    Vector(Vec<f64>),
}

impl Loggable {
    /// Name of the variant, used in error messages.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Nothing => "Nothing",
            Self::Scalar(_) => "Scalar",
            Self::Vector(_) => "Vector",
        }
    }
}

impl From<f64> for Loggable {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<f64>> for Loggable {
    fn from(value: Vec<f64>) -> Self {
        Self::Vector(value)
    }
}

/// Log statistics from an optimization run.
pub trait StatsLogger {
    /// Log a value.
    ///
    /// # Args
    /// * `name` - The name that identifies this value.
    /// * `value` - The value to log.
    ///
    /// # Returns
    /// May return an error if the logged value is structurally incompatible
    /// with previous values logged under the same name.
    fn log(&mut self, name: &'static str, value: Loggable) -> Result<(), LogError>;

    /// Mark the end of an iteration.
    fn done(&mut self);

    /// Log a scalar, panicking on an incompatible value.
    fn unwrap_log_scalar(&mut self, name: &'static str, value: f64) {
        self.log(name, value.into()).unwrap()
    }
}

/// Logger that does nothing
impl StatsLogger for () {
    fn log(&mut self, _: &'static str, _: Loggable) -> Result<(), LogError> {
        Ok(())
    }

    fn done(&mut self) {}
}

impl<T: StatsLogger + ?Sized> StatsLogger for &mut T {
    fn log(&mut self, name: &'static str, value: Loggable) -> Result<(), LogError> {
        T::log(self, name, value)
    }

    fn done(&mut self) {
        T::done(self)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("\"{name}\": incompatible value {value:?}, expected {expected}")]
pub struct LogError {
    name: &'static str,
    value: Loggable,
    expected: &'static str,
}

impl LogError {
    pub const fn new(name: &'static str, value: Loggable, expected: &'static str) -> Self {
        Self {
            name,
            value,
            expected,
        }
    }
}
