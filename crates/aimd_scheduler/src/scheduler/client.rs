use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use futures::future::BoxFuture;
use pin_project::pin_project;
use tokio::sync::oneshot;

use super::{
    SchedulerSettings, SettingsError, SubmitError,
    classify::Classify,
    dispatcher::{Dispatcher, PendingTask, SchedulerSnapshot, Settled},
};

/// Handle to one adaptive scheduler. Cheap to clone; clones share all state.
///
/// Every task submitted through any clone competes for the same token bucket, concurrency
/// limit and global pause.
#[derive(Clone)]
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(settings)),
        })
    }

    pub fn settings(&self) -> &SchedulerSettings {
        self.dispatcher.settings()
    }

    /// Queues `task` and returns a future for its result.
    ///
    /// Never blocks: the task is started later, once the scheduler admits it. The task is
    /// attempted exactly once and its own result or error comes back unchanged. Its outcome
    /// only influences when later tasks are admitted.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit<F, Fut, T, E>(&self, task: F) -> Submission<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Classify + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let run = move || -> BoxFuture<'static, Settled> {
            Box::pin(async move {
                let result = task().await;
                let failure = result.as_ref().err().map(Classify::classify);
                Settled {
                    failure,
                    deliver: Box::new(move || {
                        // The submitter may have stopped waiting.
                        let _ = tx.send(result);
                    }),
                }
            })
        };

        self.dispatcher.enqueue(PendingTask::new(Box::new(run)));
        Submission {
            rx,
            _dispatcher: Arc::clone(&self.dispatcher),
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.dispatcher.snapshot()
    }

    /// Whether both handles drive the same scheduler.
    pub fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.dispatcher, &other.dispatcher)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", self.settings())
            .field("state", &self.snapshot())
            .finish()
    }
}

/// The pending result of a submitted task.
///
/// Keeps the scheduler alive until the task settles, even if every [`Scheduler`] handle is
/// dropped in the meantime.
#[pin_project]
#[must_use = "dropping a Submission does not cancel the task, only discards its result"]
pub struct Submission<T, E> {
    #[pin]
    rx: oneshot::Receiver<Result<T, E>>,
    _dispatcher: Arc<Dispatcher>,
}

impl<T, E> Future for Submission<T, E> {
    type Output = Result<T, SubmitError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        Poll::Ready(match ready!(this.rx.poll(cx)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(SubmitError::Task(error)),
            Err(_) => Err(SubmitError::Abandoned),
        })
    }
}
