use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use super::{
    SchedulerSettings,
    backoff::{BackoffPolicy, MAX_RETRY_AFTER},
    classify::Failure,
    controller::{Adjustment, CongestionController},
    instant_now,
    internal_event::{
        InternalEvent, SchedulerLimitsUpdated, SchedulerPaused, SchedulerQueueDepth, TaskSettled,
    },
    pacer::TokenBucket,
};

/// Shortest delay the dispatcher re-arms its timer for while work is queued.
const MIN_TIMER_DELAY: Duration = Duration::from_millis(10);

/// What a task reports back once it has run: its normalized failure, if any, and a closure
/// that hands the original result to the submitter.
pub(super) struct Settled {
    pub(super) failure: Option<Failure>,
    pub(super) deliver: Box<dyn FnOnce() + Send>,
}

/// A queued unit of work. Runs at most once.
pub(super) struct PendingTask {
    run: Box<dyn FnOnce() -> BoxFuture<'static, Settled> + Send>,
}

impl PendingTask {
    pub(super) fn new(run: Box<dyn FnOnce() -> BoxFuture<'static, Settled> + Send>) -> Self {
        Self { run }
    }
}

/// Everything the dispatcher mutates. Only ever touched under [`Dispatcher::state`].
struct State {
    bucket: TokenBucket,
    controller: CongestionController,
    queue: VecDeque<PendingTask>,
    in_flight: usize,
    pause_until: Instant,
    retry_streak: u32,
    timer_fire_at: Option<Instant>,
    timer_task: Option<JoinHandle<()>>,
}

/// Point-in-time copy of the dispatcher state.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerSnapshot {
    pub capacity: f64,
    pub rate: f64,
    pub tokens: f64,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub queued: usize,
    pub success_streak: u32,
    pub retry_streak: u32,
    pub ewma_latency: Duration,
    /// The instant before which nothing is dispatched. Never moves backwards.
    pub paused_until: Instant,
    pub pause_remaining: Duration,
    /// When the single pending timer fires, if one is armed.
    pub timer_fire_at: Option<Instant>,
}

pub(super) struct Dispatcher {
    settings: SchedulerSettings,
    backoff: BackoffPolicy,
    state: Mutex<State>,
    timer: watch::Sender<Option<Instant>>,
}

impl Dispatcher {
    pub(super) fn new(settings: SchedulerSettings) -> Self {
        let now = instant_now();
        let (timer, _) = watch::channel(None);
        Self {
            backoff: BackoffPolicy::new(&settings),
            state: Mutex::new(State {
                bucket: TokenBucket::new(settings.bucket_size, now),
                controller: CongestionController::new(settings),
                queue: VecDeque::new(),
                in_flight: 0,
                pause_until: now,
                retry_streak: 0,
                timer_fire_at: None,
                timer_task: None,
            }),
            timer,
            settings,
        }
    }

    pub(super) fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("scheduler state mutex is poisoned")
    }

    pub(super) fn enqueue(self: &Arc<Self>, task: PendingTask) {
        self.lock().queue.push_back(task);
        self.drain();
    }

    pub(super) fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.lock();
        let now = instant_now();
        SchedulerSnapshot {
            capacity: state.controller.capacity(),
            rate: state.controller.rate(),
            tokens: state.bucket.tokens(),
            in_flight: state.in_flight,
            max_concurrent: state.controller.max_concurrent(),
            queued: state.queue.len(),
            success_streak: state.controller.success_streak(),
            retry_streak: state.retry_streak,
            ewma_latency: state.controller.ewma_latency(),
            paused_until: state.pause_until,
            pause_remaining: state.pause_until.saturating_duration_since(now),
            timer_fire_at: state.timer_fire_at,
        }
    }

    /// Dispatches as many queued tasks as the pause, the bucket and the concurrency limit allow,
    /// then re-arms the timer if anything is left.
    pub(super) fn drain(self: &Arc<Self>) {
        let (ready, depth) = {
            let mut state = self.lock();
            let now = instant_now();
            let rate = state.controller.rate();
            state.bucket.refill(now, rate);

            if state.queue.is_empty() {
                return;
            }

            if now < state.pause_until {
                let resume_at = state.pause_until;
                self.arm_timer(&mut state, resume_at);
                return;
            }

            let max_concurrent = state.controller.max_concurrent();
            let mut ready = Vec::new();
            while state.in_flight < max_concurrent
                && !state.queue.is_empty()
                && state.bucket.try_take()
            {
                if let Some(task) = state.queue.pop_front() {
                    state.in_flight += 1;
                    ready.push(task);
                }
            }

            if !state.queue.is_empty() {
                let delay = state
                    .bucket
                    .time_until_next_token(rate)
                    .max(state.pause_until.saturating_duration_since(now))
                    .max(MIN_TIMER_DELAY);
                self.arm_timer(&mut state, now + delay);
            }

            let depth = SchedulerQueueDepth {
                queued: state.queue.len(),
                in_flight: state.in_flight,
            };
            (ready, depth)
        };

        depth.emit();
        for task in ready {
            debug!(
                in_flight = depth.in_flight,
                queued = depth.queued,
                "Dispatching task."
            );
            self.spawn_task(task);
        }
    }

    fn spawn_task(self: &Arc<Self>, task: PendingTask) {
        let slot = InFlightSlot {
            dispatcher: Some(Arc::clone(self)),
        };
        tokio::spawn(async move {
            let started = instant_now();
            match AssertUnwindSafe((task.run)()).catch_unwind().await {
                Ok(settled) => slot.settle(started, settled.failure, Some(settled.deliver)),
                Err(_) => {
                    error!(message = "Task panicked; treating it as a failure without a status.");
                    slot.settle(started, Some(Failure::unknown()), None);
                }
            }
        });
    }

    /// Frees the concurrency slot of a task that was dropped without settling.
    fn release_dropped(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        warn!(
            message = "Task dropped before settling; releasing its slot.",
            in_flight = state.in_flight
        );
    }

    /// Feeds one settled task into the controller and backoff policy, releases its concurrency
    /// slot, hands the result back, and tries to dispatch more work.
    fn settle(
        self: &Arc<Self>,
        started: Instant,
        failure: Option<Failure>,
        deliver: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let latency = instant_now().saturating_duration_since(started);
        let class = failure.as_ref().map(Failure::class);

        let (adjustment, paused) = {
            let mut state = self.lock();
            let adjustment;
            let mut paused = None;
            match &failure {
                None => {
                    state.retry_streak = 0;
                    adjustment = state.controller.on_success(latency);
                }
                Some(failure) => {
                    let class = failure.class();
                    adjustment = state.controller.on_failure(class.penalizes());
                    let decision = self.backoff.on_failure(
                        failure,
                        state.retry_streak,
                        chrono::Utc::now(),
                        &mut rand::rng(),
                    );
                    state.retry_streak = decision.retry_streak;
                    let now = instant_now();
                    let resume_at = now
                        .checked_add(decision.pause)
                        .unwrap_or_else(|| now + MAX_RETRY_AFTER);
                    if resume_at > state.pause_until {
                        state.pause_until = resume_at;
                    }
                    paused = Some(SchedulerPaused {
                        class,
                        pause: decision.pause,
                        retry_streak: decision.retry_streak,
                    });
                }
            }
            state.in_flight = state.in_flight.saturating_sub(1);

            let adjustment = (adjustment != Adjustment::Unchanged).then(|| SchedulerLimitsUpdated {
                capacity: state.controller.capacity(),
                rate: state.controller.rate(),
                increased: adjustment == Adjustment::Increased,
            });
            (adjustment, paused)
        };

        TaskSettled { class, latency }.emit();
        if let Some(event) = adjustment {
            event.emit();
        }
        if let Some(event) = paused {
            event.emit();
        }

        if let Some(deliver) = deliver {
            deliver();
        }
        self.drain();
    }

    /// Arms the single timer for `at` unless one is already due no later than that.
    ///
    /// The driver task lives on the runtime that first armed it. If that runtime has shut
    /// down, its pending deadline is discarded and a new driver starts on the current one.
    fn arm_timer(self: &Arc<Self>, state: &mut State, at: Instant) {
        let driver_alive = state
            .timer_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if !driver_alive {
            state.timer_fire_at = None;
        }

        if state.timer_fire_at.is_some_and(|pending| pending <= at) {
            return;
        }
        state.timer_fire_at = Some(at);

        if !driver_alive {
            state.timer_task = Some(tokio::spawn(run_timer(
                Arc::downgrade(self),
                self.timer.subscribe(),
            )));
        }
        self.timer.send_replace(Some(at));
        trace!(
            fire_in_ms = at.saturating_duration_since(instant_now()).as_millis(),
            "Timer armed."
        );
    }

    fn on_timer_fired(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            let now = instant_now();
            if state.timer_fire_at.is_some_and(|at| at <= now) {
                state.timer_fire_at = None;
            }
        }
        self.drain();
    }
}

/// Owns one dispatched task's concurrency slot.
///
/// Settling consumes the slot. Dropping it unsettled, as happens to tasks still running when
/// their runtime shuts down, releases the slot instead.
struct InFlightSlot {
    dispatcher: Option<Arc<Dispatcher>>,
}

impl InFlightSlot {
    fn settle(
        mut self,
        started: Instant,
        failure: Option<Failure>,
        deliver: Option<Box<dyn FnOnce() + Send>>,
    ) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.settle(started, failure, deliver);
        }
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.release_dropped();
        }
    }
}

/// Drives the dispatcher's one timer. The same `Sleep` is reset for every new deadline.
async fn run_timer(dispatcher: Weak<Dispatcher>, mut deadlines: watch::Receiver<Option<Instant>>) {
    let sleep = tokio::time::sleep_until(instant_now());
    tokio::pin!(sleep);
    let mut armed = false;

    loop {
        tokio::select! {
            () = &mut sleep, if armed => {
                armed = false;
                let Some(dispatcher) = dispatcher.upgrade() else {
                    return;
                };
                dispatcher.on_timer_fired();
            }
            changed = deadlines.changed() => {
                if changed.is_err() {
                    return;
                }
                match *deadlines.borrow_and_update() {
                    Some(at) => {
                        sleep.as_mut().reset(at);
                        armed = true;
                    }
                    None => armed = false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_is_only_moved_earlier() {
        let dispatcher = Arc::new(Dispatcher::new(SchedulerSettings::default()));
        let now = instant_now();

        {
            let mut state = dispatcher.lock();
            dispatcher.arm_timer(&mut state, now + Duration::from_millis(100));
            dispatcher.arm_timer(&mut state, now + Duration::from_millis(500));
            assert_eq!(state.timer_fire_at, Some(now + Duration::from_millis(100)));

            dispatcher.arm_timer(&mut state, now + Duration::from_millis(100));
            assert_eq!(state.timer_fire_at, Some(now + Duration::from_millis(100)));

            dispatcher.arm_timer(&mut state, now + Duration::from_millis(50));
            assert_eq!(state.timer_fire_at, Some(now + Duration::from_millis(50)));
        }
        assert_eq!(*dispatcher.timer.borrow(), Some(now + Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_clears_pending_deadline() {
        let dispatcher = Arc::new(Dispatcher::new(SchedulerSettings::default()));
        let now = instant_now();
        {
            let mut state = dispatcher.lock();
            dispatcher.arm_timer(&mut state, now + Duration::from_millis(40));
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(dispatcher.snapshot().timer_fire_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_never_arms_a_timer() {
        let dispatcher = Arc::new(Dispatcher::new(SchedulerSettings::default()));
        dispatcher.drain();
        let snapshot = dispatcher.snapshot();
        assert_eq!(snapshot.timer_fire_at, None);
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.tokens, 2.0);
    }
}
