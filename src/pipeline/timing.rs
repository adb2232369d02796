//! Smoothed capture-rate estimate from frame arrival times

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::RecorderConfig;

/// EWMA estimator of the effective frame rate.
///
/// Keeps a bounded history of arrival instants. Each observation averages
/// the positive deltas of the most recent `window` arrivals, inverts that to
/// an instantaneous rate and blends it into the running estimate. The
/// estimate starts at, and falls back to, the configured default rate.
#[derive(Debug, Clone)]
pub struct FrameTimingEstimator {
    history: VecDeque<Instant>,
    history_len: usize,
    window: usize,
    smoothing: f64,
    default_rate: f64,
    estimate: f64,
}

impl FrameTimingEstimator {
    pub fn new(config: &RecorderConfig) -> Self {
        debug_assert!(config.default_fps > 0.0);
        Self {
            history: VecDeque::with_capacity(config.timing_history),
            history_len: config.timing_history.max(2),
            window: config.rate_window.max(2),
            smoothing: config.smoothing,
            default_rate: config.default_fps,
            estimate: config.default_fps,
        }
    }

    /// Record an arrival and return the updated rate estimate.
    pub fn observe(&mut self, timestamp: Instant) -> f64 {
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(timestamp);

        if self.history.len() < 2 {
            return self.default_rate;
        }

        let start = self.history.len().saturating_sub(self.window);
        let recent = self.history.range(start..);
        let (sum, count) = recent
            .clone()
            .zip(recent.skip(1))
            .map(|(prev, next)| next.saturating_duration_since(*prev).as_secs_f64())
            // Out-of-order and duplicate arrivals carry no rate information.
            .filter(|dt| *dt > 0.0)
            .fold((0.0, 0usize), |(sum, n), dt| (sum + dt, n + 1));

        if count == 0 {
            return self.estimate;
        }

        let instantaneous = count as f64 / sum;
        self.estimate = (1.0 - self.smoothing) * self.estimate + self.smoothing * instantaneous;
        self.estimate
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn default_rate(&self) -> f64 {
        self.default_rate
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }
}
