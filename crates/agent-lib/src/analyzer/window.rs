//! Count-based rolling statistics
//!
//! Keeps the most recent `capacity` values and recomputes mean and standard
//! deviation on each push in two passes over the window.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
    mean: f64,
    std_dev: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            mean: 0.0,
            std_dev: 0.0,
        }
    }

    /// Add a value, evicting the oldest once full
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.recalculate();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    /// Standard score of `value` against the window, with `floor` as the
    /// smallest standard deviation used
    pub fn z_score(&self, value: f64, floor: f64) -> f64 {
        (value - self.mean) / self.std_dev.max(floor).max(f64::EPSILON)
    }

    fn recalculate(&mut self) {
        let count = self.values.len();
        if count == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }

        self.mean = self.values.iter().sum::<f64>() / count as f64;

        if count > 1 {
            // Sample variance (Bessel's correction)
            let variance = self
                .values
                .iter()
                .map(|v| (v - self.mean).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            self.std_dev = variance.sqrt();
        } else {
            self.std_dev = 0.0;
        }
    }
}
