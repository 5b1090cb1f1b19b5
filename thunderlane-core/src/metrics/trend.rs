//! Sliding-window trend classification.

use std::collections::VecDeque;

use crate::coupling::PerformanceTrend;

/// Relative change across the window that counts as a real move.
pub const TREND_THRESHOLD: f64 = 0.05;

/// Bounded window of samples for one series.
#[derive(Debug, Clone)]
pub struct TrendWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl TrendWindow {
    /// Window holding at most `capacity` samples (at least two).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full. Non-finite values are dropped.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Samples held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Classify the window with [`classify_series`].
    #[must_use]
    pub fn trend(&self) -> PerformanceTrend {
        let samples: Vec<f64> = self.samples.iter().copied().collect();
        classify_series(&samples)
    }
}

/// Least-squares slope projected over the window, relative to the mean.
///
/// Above `+5%` is improving, below `-5%` degrading, anything between stable.
/// Fewer than two samples is unknown. A zero mean compares the absolute
/// projected change instead.
#[must_use]
pub fn classify_series(samples: &[f64]) -> PerformanceTrend {
    let n = samples.len();
    if n < 2 {
        return PerformanceTrend::Unknown;
    }
    let count = n as f64;
    let mean_x = (count - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<f64>() / count;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, &y) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    let change = num / den * (count - 1.0);
    let relative = if mean_y.abs() > f64::EPSILON {
        change / mean_y.abs()
    } else {
        change
    };
    if relative > TREND_THRESHOLD {
        PerformanceTrend::Improving
    } else if relative < -TREND_THRESHOLD {
        PerformanceTrend::Degrading
    } else {
        PerformanceTrend::Stable
    }
}
