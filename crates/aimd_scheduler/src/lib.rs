//! Adaptive rate-limited request scheduler for shared, latency-variable backends.
//!
//! Work is submitted as opaque tasks. The scheduler decides when each task may start,
//! combining three mechanisms:
//!
//! 1. **Pacing**: a token bucket refilled continuously at an adaptive rate.
//! 2. **Congestion avoidance**: an AIMD controller that grows concurrency and rate slowly on
//!    success and cuts both sharply on failure.
//! 3. **Backoff**: a global pause after throttling or infrastructure failures, honouring
//!    `Retry-After` hints and applying full jitter otherwise.
//!
//! A task is attempted exactly once. Its outcome only shapes how *later* tasks are admitted;
//! the original result or error is always handed back to the caller.
//!
//! # Basic Usage
//! ```no_run
//! use aimd_scheduler::scheduler::{Scheduler, SchedulerSettings, classify::Failure};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let scheduler = Scheduler::new(SchedulerSettings::default())?;
//! let answer = scheduler
//!     .submit(|| async { Ok::<_, Failure>("pong") })
//!     .await
//!     .map_err(|e| e.to_string())?;
//! assert_eq!(answer, "pong");
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//! See [`scheduler::SchedulerSettings`] for tuning parameters.
//!
//! # Metrics
//! Emits metrics via the [`scheduler::internal_event::InternalEvent`] trait.
pub mod registry;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
