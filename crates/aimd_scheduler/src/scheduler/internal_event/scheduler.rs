use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::InternalEvent;
use crate::scheduler::classify::FailureClass;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerLimitsUpdated {
    pub capacity: f64,
    pub rate: f64,
    pub increased: bool,
}

impl InternalEvent for SchedulerLimitsUpdated {
    fn emit(self) {
        // Gauges, as only the latest value matters for diagnosis.
        gauge!("scheduler_capacity").set(self.capacity);
        gauge!("scheduler_rate").set(self.rate);
        if self.increased {
            info!(
                target: "aimd_scheduler::stats",
                capacity = self.capacity,
                rate = self.rate,
                "Limits increased."
            );
        } else {
            warn!(
                target: "aimd_scheduler::stats",
                capacity = self.capacity,
                rate = self.rate,
                "Limits decreased."
            );
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TaskSettled {
    /// `None` for successful tasks.
    pub class: Option<FailureClass>,
    pub latency: Duration,
}

impl InternalEvent for TaskSettled {
    fn emit(self) {
        let outcome = self.class.map_or("success", |class| class.as_str());
        counter!("scheduler_tasks_settled_total", "outcome" => outcome).increment(1);
        histogram!("scheduler_task_latency_seconds").record(self.latency);
        trace!(
            target: "aimd_scheduler::stats",
            outcome,
            latency_ms = self.latency.as_millis(),
            "Task settled."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerPaused {
    pub class: FailureClass,
    pub pause: Duration,
    pub retry_streak: u32,
}

impl InternalEvent for SchedulerPaused {
    fn emit(self) {
        counter!("scheduler_pauses_total", "class" => self.class.as_str()).increment(1);
        histogram!("scheduler_pause_seconds").record(self.pause);
        warn!(
            target: "aimd_scheduler::stats",
            class = self.class.as_str(),
            pause_ms = self.pause.as_millis(),
            retry_streak = self.retry_streak,
            "Pausing dispatch."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerQueueDepth {
    pub queued: usize,
    pub in_flight: usize,
}

impl InternalEvent for SchedulerQueueDepth {
    fn emit(self) {
        gauge!("scheduler_queue_depth").set(self.queued as f64);
        gauge!("scheduler_in_flight").set(self.in_flight as f64);
        trace!(
            target: "aimd_scheduler::stats",
            queued = self.queued,
            in_flight = self.in_flight,
            "Queue depth updated."
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::{Layer, layer::Context, prelude::*};

    use super::*;

    #[derive(Clone, Default)]
    struct RecordedLevels(Arc<Mutex<Vec<Level>>>);

    impl<S: Subscriber> Layer<S> for RecordedLevels {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    #[test]
    fn increases_log_at_info_and_decreases_at_warn() {
        let levels = RecordedLevels::default();
        let subscriber = tracing_subscriber::registry().with(levels.clone());

        tracing::subscriber::with_default(subscriber, || {
            SchedulerLimitsUpdated {
                capacity: 3.2,
                rate: 1.1,
                increased: true,
            }
            .emit();
            SchedulerLimitsUpdated {
                capacity: 1.6,
                rate: 0.55,
                increased: false,
            }
            .emit();
        });

        assert_eq!(*levels.0.lock().unwrap(), vec![Level::INFO, Level::WARN]);
    }

    #[test]
    fn limits_and_settles_are_recorded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            SchedulerLimitsUpdated {
                capacity: 1.5,
                rate: 0.5,
                increased: false,
            }
            .emit();
            TaskSettled {
                class: Some(FailureClass::Throttled),
                latency: Duration::from_millis(120),
            }
            .emit();
            TaskSettled {
                class: None,
                latency: Duration::from_millis(80),
            }
            .emit();
        });

        let metrics = snapshotter.snapshot().into_vec();
        let capacity = metrics
            .iter()
            .find(|(key, ..)| key.key().name() == "scheduler_capacity")
            .map(|(.., value)| value);
        assert!(matches!(capacity, Some(DebugValue::Gauge(v)) if v.into_inner() == 1.5));

        let settled: u64 = metrics
            .iter()
            .filter(|(key, ..)| key.key().name() == "scheduler_tasks_settled_total")
            .map(|(.., value)| match value {
                DebugValue::Counter(count) => *count,
                _ => 0,
            })
            .sum();
        assert_eq!(settled, 2);
    }
}
