//! Metrics and log events emitted by the scheduler.

mod scheduler;

pub use self::scheduler::{
    SchedulerLimitsUpdated, SchedulerPaused, SchedulerQueueDepth, TaskSettled,
};

/// An event that records itself to the `metrics` facade and logs through `tracing`.
///
/// Without an installed metrics recorder, emitting only logs.
pub trait InternalEvent: Sized {
    fn emit(self);
}
