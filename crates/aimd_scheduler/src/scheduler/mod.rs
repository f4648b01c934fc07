//! Pace, limit and back off work submitted against one shared backend.

pub mod backoff;
pub mod classify;
mod client;
mod controller;
mod dispatcher;
pub mod http;
pub mod internal_event;
pub mod layer;
mod pacer;
pub mod reqwest_integration;
pub mod service;

use std::{fmt, time::Duration};

use bon::Builder;
use serde::Deserialize;
use snafu::{Snafu, ensure};

pub use backoff::JitterMode;
pub use client::{Scheduler, Submission};
pub use dispatcher::SchedulerSnapshot;
pub use layer::SchedulerLayer;
pub use service::SchedulerService;

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// Configuration of the scheduler's pacing, congestion-avoidance and backoff parameters.
///
/// The defaults suit a single credential against a hosted LLM completion endpoint. They are
/// deliberately conservative: three requests in flight, one new request per second, and a
/// burst allowance of two.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `initial_capacity` | 3.0 | Starting number of requests allowed in flight |
/// | `initial_rate` | 1.0 | Starting token refill rate, per second |
/// | `bucket_size` | 2.0 | Maximum number of buffered tokens (burst size) |
/// | `ewma_alpha` | 0.05 | Smoothing factor for the latency average |
/// | `additive_step` | 0.2 | Capacity gained per increase event |
/// | `decrease_ratio` | 0.5 | Capacity multiplier on a penalty |
/// | `rate_step` | 0.1 | Rate gained per increase event |
/// | `rate_decrease_ratio` | 0.5 | Rate multiplier on a penalty |
/// | `initial_latency_estimate_secs` | 0.25 | Seed for the latency average |
/// | `jitter_max_ms` | 250 | Upper bound of jitter added to hinted pauses |
/// | `backoff_base_ms` | 200 | Base of the exponential backoff |
/// | `backoff_cap_ms` | 5000 | Cap of the exponential backoff |
/// | `jitter_mode` | `full` | Whether pauses are randomized |
///
/// # Example
///
/// ```rust
/// use aimd_scheduler::scheduler::SchedulerSettings;
///
/// let settings = SchedulerSettings::builder()
///     .initial_capacity(5.0)
///     .initial_rate(2.0)
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Builder, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerSettings {
    /// Starting maximum of concurrently running tasks. Never drops below 1.
    #[builder(default = default_initial_capacity())]
    pub(super) initial_capacity: f64,

    /// Starting number of tokens added to the bucket per second. Never drops below 0.1.
    #[builder(default = default_initial_rate())]
    pub(super) initial_rate: f64,

    /// Maximum number of tokens the bucket holds, i.e. the largest burst of dispatches.
    #[builder(default = default_bucket_size())]
    pub(super) bucket_size: f64,

    /// Smoothing factor for the latency EWMA.
    ///
    /// `new_avg = (1 - alpha) * previous_avg + alpha * current`
    #[builder(default = default_ewma_alpha())]
    pub(super) ewma_alpha: f64,

    /// Capacity added every time enough consecutive successes have been observed.
    #[builder(default = default_additive_step())]
    pub(super) additive_step: f64,

    /// Multiplicative capacity decrease applied on throttling or infrastructure failures.
    #[builder(default = default_decrease_ratio())]
    pub(super) decrease_ratio: f64,

    /// Rate added alongside every capacity increase.
    #[builder(default = default_rate_step())]
    pub(super) rate_step: f64,

    /// Multiplicative rate decrease applied alongside every capacity decrease.
    #[builder(default = default_rate_decrease_ratio())]
    pub(super) rate_decrease_ratio: f64,

    /// Latency assumed before the first response has been observed.
    #[builder(default = default_initial_latency_estimate_secs())]
    pub(super) initial_latency_estimate_secs: f64,

    /// Upper bound (exclusive) of the random jitter added to hinted and fixed pauses.
    #[builder(default = default_jitter_max_ms())]
    pub(super) jitter_max_ms: u64,

    /// Base of the exponential backoff: `min(cap, base * 2^streak)`.
    #[builder(default = default_backoff_base_ms())]
    pub(super) backoff_base_ms: u64,

    /// Cap of the exponential backoff.
    #[builder(default = default_backoff_cap_ms())]
    pub(super) backoff_cap_ms: u64,

    #[builder(default)]
    pub(super) jitter_mode: JitterMode,
}

const fn default_initial_capacity() -> f64 {
    3.0
}

const fn default_initial_rate() -> f64 {
    1.0
}

const fn default_bucket_size() -> f64 {
    2.0
}

const fn default_ewma_alpha() -> f64 {
    0.05
}

const fn default_additive_step() -> f64 {
    0.2
}

const fn default_decrease_ratio() -> f64 {
    0.5
}

const fn default_rate_step() -> f64 {
    0.1
}

const fn default_rate_decrease_ratio() -> f64 {
    0.5
}

const fn default_initial_latency_estimate_secs() -> f64 {
    0.25
}

const fn default_jitter_max_ms() -> u64 {
    250
}

const fn default_backoff_base_ms() -> u64 {
    200
}

const fn default_backoff_cap_ms() -> u64 {
    5000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            initial_capacity: default_initial_capacity(),
            initial_rate: default_initial_rate(),
            bucket_size: default_bucket_size(),
            ewma_alpha: default_ewma_alpha(),
            additive_step: default_additive_step(),
            decrease_ratio: default_decrease_ratio(),
            rate_step: default_rate_step(),
            rate_decrease_ratio: default_rate_decrease_ratio(),
            initial_latency_estimate_secs: default_initial_latency_estimate_secs(),
            jitter_max_ms: default_jitter_max_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter_mode: JitterMode::default(),
        }
    }
}

impl SchedulerSettings {
    pub fn initial_capacity(&self) -> f64 {
        self.initial_capacity
    }

    pub fn initial_rate(&self) -> f64 {
        self.initial_rate
    }

    pub fn bucket_size(&self) -> f64 {
        self.bucket_size
    }

    pub fn ewma_alpha(&self) -> f64 {
        self.ewma_alpha
    }

    pub fn additive_step(&self) -> f64 {
        self.additive_step
    }

    pub fn decrease_ratio(&self) -> f64 {
        self.decrease_ratio
    }

    pub fn rate_step(&self) -> f64 {
        self.rate_step
    }

    pub fn rate_decrease_ratio(&self) -> f64 {
        self.rate_decrease_ratio
    }

    pub fn initial_latency_estimate(&self) -> Duration {
        Duration::from_secs_f64(self.initial_latency_estimate_secs)
    }

    pub fn jitter_max(&self) -> Duration {
        Duration::from_millis(self.jitter_max_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn jitter_mode(&self) -> JitterMode {
        self.jitter_mode
    }

    /// Checks that every parameter lies in the range the algorithms assume.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let finite = [
            ("initial_capacity", self.initial_capacity),
            ("initial_rate", self.initial_rate),
            ("bucket_size", self.bucket_size),
            ("ewma_alpha", self.ewma_alpha),
            ("additive_step", self.additive_step),
            ("decrease_ratio", self.decrease_ratio),
            ("rate_step", self.rate_step),
            ("rate_decrease_ratio", self.rate_decrease_ratio),
            ("initial_latency_estimate_secs", self.initial_latency_estimate_secs),
        ];
        for (name, value) in finite {
            ensure!(
                value.is_finite(),
                InvalidSettingSnafu {
                    name,
                    reason: format!("must be finite, got {value}"),
                }
            );
        }

        ensure!(
            self.initial_capacity >= 1.0,
            InvalidSettingSnafu {
                name: "initial_capacity",
                reason: "must be at least 1",
            }
        );
        ensure!(
            self.initial_rate > 0.0,
            InvalidSettingSnafu {
                name: "initial_rate",
                reason: "must be positive",
            }
        );
        ensure!(
            self.bucket_size >= 1.0,
            InvalidSettingSnafu {
                name: "bucket_size",
                reason: "must hold at least one token",
            }
        );
        ensure!(
            self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0,
            InvalidSettingSnafu {
                name: "ewma_alpha",
                reason: "must be in (0, 1]",
            }
        );
        for (name, ratio) in [
            ("decrease_ratio", self.decrease_ratio),
            ("rate_decrease_ratio", self.rate_decrease_ratio),
        ] {
            ensure!(
                ratio > 0.0 && ratio <= 1.0,
                InvalidSettingSnafu {
                    name,
                    reason: "must be in (0, 1]",
                }
            );
        }
        for (name, step) in [
            ("additive_step", self.additive_step),
            ("rate_step", self.rate_step),
            ("initial_latency_estimate_secs", self.initial_latency_estimate_secs),
        ] {
            ensure!(
                step >= 0.0,
                InvalidSettingSnafu {
                    name,
                    reason: "must not be negative",
                }
            );
        }
        ensure!(
            self.backoff_base_ms > 0,
            InvalidSettingSnafu {
                name: "backoff_base_ms",
                reason: "must be positive",
            }
        );
        ensure!(
            self.backoff_cap_ms >= self.backoff_base_ms,
            InvalidSettingSnafu {
                name: "backoff_cap_ms",
                reason: "must not be smaller than backoff_base_ms",
            }
        );
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("Invalid scheduler setting `{name}`: {reason}"))]
    InvalidSetting { name: &'static str, reason: String },
}

/// Error returned to the submitter of a task.
///
/// The task's own error is always handed back unchanged inside [`SubmitError::Task`].
#[derive(Debug)]
pub enum SubmitError<E> {
    /// The task ran and failed.
    Task(E),
    /// The task was dropped before it produced a result, because it panicked or the
    /// scheduler was torn down while it was still queued.
    Abandoned,
}

impl<E> SubmitError<E> {
    /// Returns the task's own error, if the task ran.
    pub fn into_task_error(self) -> Option<E> {
        match self {
            SubmitError::Task(error) => Some(error),
            SubmitError::Abandoned => None,
        }
    }

    pub fn task_error(&self) -> Option<&E> {
        match self {
            SubmitError::Task(error) => Some(error),
            SubmitError::Abandoned => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for SubmitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Task(error) => write!(f, "task failed: {}", error),
            SubmitError::Abandoned => {
                write!(f, "task was abandoned before producing a result")
            }
        }
    }
}

impl<E> std::error::Error for SubmitError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmitError::Task(error) => Some(error),
            SubmitError::Abandoned => None,
        }
    }
}
