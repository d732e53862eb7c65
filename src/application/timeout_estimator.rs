//! Adaptive timeout derived from recent successful durations
//!
//! timeout = clamp(v + max(buffer_ratio × v, buffer_floor), min, max),
//! where v = mean + 2 × stdev over the rolling window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::infrastructure::config::TimeoutConfig;

/// Rolling window of successful operation durations
#[derive(Debug)]
pub struct TimeoutEstimator {
    config: TimeoutConfig,
    window: Mutex<VecDeque<f64>>,
}

impl TimeoutEstimator {
    pub fn new(config: TimeoutConfig) -> Self {
        let capacity = config.window_size;
        Self {
            config,
            window: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Feed one successful duration. Failed attempts must not be recorded.
    pub fn record_success(&self, duration: Duration) {
        let mut window = self.lock();
        while window.len() >= self.config.window_size.max(1) {
            window.pop_front();
        }
        window.push_back(duration.as_secs_f64());
    }

    /// Warm the window, e.g. from stored samples (oldest first)
    pub fn seed<I>(&self, durations: I)
    where
        I: IntoIterator<Item = Duration>,
    {
        for duration in durations {
            self.record_success(duration);
        }
        debug!("⏱️ Timeout estimator seeded ({} samples)", self.len());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn current_timeout(&self) -> Duration {
        let samples: Vec<f64> = self.lock().iter().copied().collect();
        Duration::from_secs_f64(compute_timeout_secs(&samples, &self.config))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<f64>> {
        // the window holds plain numbers, so a poisoned guard is still usable
        self.window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Unclamped `mean + 2·stdev` plus buffer, in seconds. `None` for an empty window.
pub fn raw_timeout_secs(samples: &[f64], config: &TimeoutConfig) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    // sample standard deviation; a single sample has none
    let stdev = if samples.len() < 2 {
        0.0
    } else {
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
        variance.sqrt()
    };
    let value = mean + 2.0 * stdev;
    let buffer = (config.buffer_ratio * value).max(config.buffer_floor_secs);
    Some(value + buffer)
}

/// Clamped timeout in seconds; an empty window yields the configured minimum
pub fn compute_timeout_secs(samples: &[f64], config: &TimeoutConfig) -> f64 {
    // max-then-min never panics, even on inverted bounds
    raw_timeout_secs(samples, config).map_or(config.min_secs, |raw| {
        raw.max(config.min_secs).min(config.max_secs)
    })
}
