//! Command-line logger
use super::{LogError, Loggable, StatsLogger};
use std::collections::BTreeMap;
use std::fmt;
use yansi::Paint;

/// Logger that displays summaries to standard output.
///
/// Values are averaged over `period` iterations before being displayed.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayLogger {
    period: u64,
    index: u64,
    summary_start_index: u64,
    aggregators: BTreeMap<&'static str, Aggregator>,
}

impl Default for DisplayLogger {
    fn default() -> Self {
        Self::new(1)
    }
}

impl DisplayLogger {
    pub fn new(period: u64) -> Self {
        Self {
            period: period.max(1),
            index: 0,
            summary_start_index: 0,
            aggregators: BTreeMap::new(),
        }
    }

    /// Display the summary and clear all stored data.
    pub fn display(&mut self) {
        if self.index == self.summary_start_index {
            return;
        }
        println!();
        println!(
            "==== Iterations {} - {} ====",
            self.summary_start_index,
            self.index - 1
        );
        for (name, aggregator) in &mut self.aggregators {
            println!("{:<24} {}", Paint::fixed(35, name), aggregator);
            aggregator.clear();
        }
        self.summary_start_index = self.index;
    }
}

impl StatsLogger for DisplayLogger {
    fn log(&mut self, name: &'static str, value: Loggable) -> Result<(), LogError> {
        if let Some(aggregator) = self.aggregators.get_mut(name) {
            aggregator
                .update(value)
                .map_err(|(value, expected)| LogError::new(name, value, expected))
        } else {
            self.aggregators.insert(name, Aggregator::new(value));
            Ok(())
        }
    }

    fn done(&mut self) {
        self.index += 1;
        if self.index - self.summary_start_index >= self.period {
            self.display();
        }
    }
}

impl Drop for DisplayLogger {
    fn drop(&mut self) {
        // Ensure everything is flushed.
        self.display();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Aggregator {
    Nothing,
    ScalarMean { sum: f64, count: u64 },
    VectorMean { sum: Vec<f64>, count: u64 },
}

impl Aggregator {
    fn new(value: Loggable) -> Self {
        match value {
            Loggable::Nothing => Self::Nothing,
            Loggable::Scalar(x) => Self::ScalarMean { sum: x, count: 1 },
            Loggable::Vector(v) => Self::VectorMean { sum: v, count: 1 },
        }
    }

    /// Returns `Err((value, expected))` if the value is incompatible with this aggregator.
    fn update(&mut self, value: Loggable) -> Result<(), (Loggable, &'static str)> {
        match (self, value) {
            (Self::Nothing, Loggable::Nothing) => {}
            (Self::ScalarMean { sum, count }, Loggable::Scalar(x)) => {
                *sum += x;
                *count += 1;
            }
            (Self::VectorMean { sum, count }, Loggable::Vector(v)) if v.len() == sum.len() => {
                for (s, x) in sum.iter_mut().zip(v) {
                    *s += x;
                }
                *count += 1;
            }
            (Self::VectorMean { sum, count }, Loggable::Vector(v)) if *count == 0 => {
                *sum = v;
                *count = 1;
            }
            (aggregator, value) => return Err((value, aggregator.expected())),
        }
        Ok(())
    }

    const fn expected(&self) -> &'static str {
        match self {
            Self::Nothing => "Nothing",
            Self::ScalarMean { .. } => "Scalar",
            Self::VectorMean { .. } => "Vector of matching length",
        }
    }

    fn clear(&mut self) {
        match self {
            Self::Nothing => {}
            Self::ScalarMean { sum, count } => {
                *sum = 0.0;
                *count = 0;
            }
            Self::VectorMean { sum, count } => {
                sum.iter_mut().for_each(|s| *s = 0.0);
                *count = 0;
            }
        }
    }
}

impl fmt::Display for Aggregator {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Nothing | Self::ScalarMean { count: 0, .. } | Self::VectorMean { count: 0, .. } => {
                Ok(())
            }
            Self::ScalarMean { sum, count } => write!(f, "{:.6e}", sum / *count as f64),
            Self::VectorMean { sum, count } => {
                write!(f, "[")?;
                for (i, s) in sum.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:.3e}", s / *count as f64)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_mean() {
        let mut agg = Aggregator::new(Loggable::Scalar(1.0));
        agg.update(Loggable::Scalar(3.0)).unwrap();
        assert_eq!(agg, Aggregator::ScalarMean { sum: 4.0, count: 2 });
        assert_eq!(agg.to_string(), "2.000000e0");
    }

    #[test]
    fn vector_mean_display() {
        let mut agg = Aggregator::new(Loggable::Vector(vec![1.0, 2.0]));
        agg.update(Loggable::Vector(vec![3.0, 4.0])).unwrap();
        assert_eq!(agg.to_string(), "[2.000e0, 3.000e0]");
    }

    #[test]
    fn incompatible_value() {
        let mut logger = DisplayLogger::new(100);
        logger.log("eta", Loggable::Scalar(1.0)).unwrap();
        let err = logger.log("eta", Loggable::Nothing).unwrap_err();
        assert_eq!(err, LogError::new("eta", Loggable::Nothing, "Scalar"));
    }

    #[test]
    fn clears_after_display() {
        let mut logger = DisplayLogger::new(2);
        logger.log("kl", Loggable::Scalar(1.0)).unwrap();
        logger.done();
        logger.log("kl", Loggable::Scalar(2.0)).unwrap();
        logger.done();
        assert_eq!(logger.summary_start_index, 2);
        assert_eq!(
            logger.aggregators["kl"],
            Aggregator::ScalarMean { sum: 0.0, count: 0 }
        );
    }
}
