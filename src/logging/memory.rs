//! In-memory logger
use super::{LogError, Loggable, StatsLogger};
use std::collections::BTreeMap;

/// Logger that records every value, grouped by iteration.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemoryLogger {
    iterations: Vec<BTreeMap<&'static str, Loggable>>,
    current: BTreeMap<&'static str, Loggable>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed iterations.
    pub fn num_iterations(&self) -> usize {
        self.iterations.len()
    }

    /// Value logged under `name` in a completed iteration.
    pub fn get(&self, iteration: usize, name: &str) -> Option<&Loggable> {
        self.iterations.get(iteration)?.get(name)
    }

    /// All scalar values logged under `name`, in iteration order.
    pub fn scalars(&self, name: &str) -> Vec<f64> {
        self.iterations
            .iter()
            .filter_map(|entries| match entries.get(name) {
                Some(Loggable::Scalar(x)) => Some(*x),
                _ => None,
            })
            .collect()
    }
}

impl StatsLogger for MemoryLogger {
    /// Values must keep the same variant under a given name.
    fn log(&mut self, name: &'static str, value: Loggable) -> Result<(), LogError> {
        let previous = self
            .current
            .get(name)
            .or_else(|| self.iterations.iter().rev().find_map(|it| it.get(name)));
        if let Some(previous) = previous {
            if std::mem::discriminant(previous) != std::mem::discriminant(&value) {
                return Err(LogError::new(name, value, previous.kind()));
            }
        }
        self.current.insert(name, value);
        Ok(())
    }

    fn done(&mut self) {
        self.iterations.push(std::mem::take(&mut self.current));
    }
}
