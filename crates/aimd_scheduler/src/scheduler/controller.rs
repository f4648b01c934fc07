use std::time::Duration;

use super::SchedulerSettings;

pub(super) const MIN_CAPACITY: f64 = 1.0;
pub(super) const MIN_RATE: f64 = 0.1;

/// What a single signal did to the limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Adjustment {
    Unchanged,
    Increased,
    Decreased,
}

/// AIMD state for the two adaptive knobs: concurrency capacity and token refill rate.
///
/// Capacity and rate move together on every event but are never re-derived from each other.
#[derive(Clone, Debug)]
pub(super) struct CongestionController {
    settings: SchedulerSettings,
    capacity: f64,
    rate: f64,
    success_streak: u32,
    ewma_latency_secs: f64,
}

impl CongestionController {
    pub(super) fn new(settings: SchedulerSettings) -> Self {
        Self {
            capacity: settings.initial_capacity.max(MIN_CAPACITY),
            rate: settings.initial_rate.max(MIN_RATE),
            success_streak: 0,
            ewma_latency_secs: settings.initial_latency_estimate_secs,
            settings,
        }
    }

    pub(super) fn capacity(&self) -> f64 {
        self.capacity
    }

    pub(super) fn rate(&self) -> f64 {
        self.rate
    }

    pub(super) fn success_streak(&self) -> u32 {
        self.success_streak
    }

    pub(super) fn ewma_latency(&self) -> Duration {
        Duration::from_secs_f64(self.ewma_latency_secs)
    }

    /// Number of tasks allowed in flight right now.
    pub(super) fn max_concurrent(&self) -> usize {
        self.capacity.floor().max(MIN_CAPACITY) as usize
    }

    /// Feeds one successful completion.
    ///
    /// The number of consecutive successes needed for an increase equals the current capacity,
    /// so larger windows grow more slowly.
    pub(super) fn on_success(&mut self, latency: Duration) -> Adjustment {
        let sample = latency.as_secs_f64();
        if sample.is_finite() && sample > 0.0 {
            let alpha = self.settings.ewma_alpha;
            self.ewma_latency_secs = (1.0 - alpha) * self.ewma_latency_secs + alpha * sample;
        }

        self.success_streak += 1;
        if f64::from(self.success_streak) >= self.capacity {
            self.capacity += self.settings.additive_step;
            self.rate += self.settings.rate_step;
            self.success_streak = 0;
            Adjustment::Increased
        } else {
            Adjustment::Unchanged
        }
    }

    /// Feeds one failed completion. `penalize` is false for failures that say nothing about
    /// backend load (plain client errors).
    pub(super) fn on_failure(&mut self, penalize: bool) -> Adjustment {
        self.success_streak = 0;
        if !penalize {
            return Adjustment::Unchanged;
        }
        self.capacity = (self.capacity * self.settings.decrease_ratio).max(MIN_CAPACITY);
        self.rate = (self.rate * self.settings.rate_decrease_ratio).max(MIN_RATE);
        Adjustment::Decreased
    }
}
