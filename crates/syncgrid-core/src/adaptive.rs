//! Adaptive forward-window sizing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::WindowConfig;

/// Result of feeding one round's volume to [`AdaptiveWindowState::observe_round`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAdjustment {
    Shrunk,
    Grown,
    Unchanged,
}

/// Forward window size kept inversely proportional to observed load.
///
/// Invariant: `min_window_seconds <= current_window_seconds <= max_window_seconds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveWindowState {
    current_window_seconds: i64,
    min_window_seconds: i64,
    max_window_seconds: i64,
    shrink_factor: f64,
    grow_factor: f64,
    commit_threshold: u64,
    rate_limit_count: u32,
}

impl AdaptiveWindowState {
    /// Build a state; bounds are normalised and `current` clamped into them.
    pub fn new(
        current: i64,
        min: i64,
        max: i64,
        shrink_factor: f64,
        grow_factor: f64,
        commit_threshold: u64,
    ) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            current_window_seconds: current.clamp(min, max),
            min_window_seconds: min,
            max_window_seconds: max,
            shrink_factor,
            grow_factor,
            commit_threshold,
            rate_limit_count: 0,
        }
    }

    pub fn from_config(config: &WindowConfig) -> Self {
        Self::new(
            config.initial_window_seconds,
            config.min_window_seconds,
            config.max_window_seconds,
            config.shrink_factor,
            config.grow_factor,
            config.commit_threshold,
        )
    }

    pub fn current_window_seconds(&self) -> i64 {
        self.current_window_seconds
    }

    pub fn min_window_seconds(&self) -> i64 {
        self.min_window_seconds
    }

    pub fn max_window_seconds(&self) -> i64 {
        self.max_window_seconds
    }

    pub fn rate_limit_count(&self) -> u32 {
        self.rate_limit_count
    }

    pub fn commit_threshold(&self) -> u64 {
        self.commit_threshold
    }

    pub fn at_min(&self) -> bool {
        self.current_window_seconds <= self.min_window_seconds
    }

    pub fn shrink(&mut self, reason: &str) {
        let before = self.current_window_seconds;
        let scaled = (before as f64 * self.shrink_factor).floor() as i64;
        self.current_window_seconds = scaled.max(self.min_window_seconds).min(before);
        debug!(
            reason,
            from = before,
            to = self.current_window_seconds,
            "shrinking fetch window"
        );
    }

    pub fn grow(&mut self) {
        let before = self.current_window_seconds;
        let scaled = (before as f64 * self.grow_factor).ceil() as i64;
        self.current_window_seconds = scaled.min(self.max_window_seconds).max(before);
        debug!(from = before, to = self.current_window_seconds, "growing fetch window");
    }

    /// Count a rate-limit signal and shrink immediately.
    pub fn record_rate_limit(&mut self) {
        self.rate_limit_count = self.rate_limit_count.saturating_add(1);
        self.shrink("rate_limited");
    }

    pub fn reset_rate_limit_count(&mut self) {
        self.rate_limit_count = 0;
    }

    /// Shrink above the commit threshold, grow below half of it.
    pub fn observe_round(&mut self, record_count: u64) -> WindowAdjustment {
        if record_count > self.commit_threshold {
            self.shrink("volume");
            WindowAdjustment::Shrunk
        } else if record_count.saturating_mul(2) < self.commit_threshold {
            self.grow();
            WindowAdjustment::Grown
        } else {
            WindowAdjustment::Unchanged
        }
    }
}
