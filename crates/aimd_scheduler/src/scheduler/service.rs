use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{Service, ServiceExt};

use super::{Scheduler, SubmitError, classify::Classify};

/// A service that submits each call of the inner service to a [`Scheduler`] as one task.
///
/// Always ready: admission happens in the scheduler's queue, not through back pressure.
#[derive(Clone, Debug)]
pub struct SchedulerService<S> {
    inner: S,
    scheduler: Scheduler,
}

impl<S> SchedulerService<S> {
    pub fn new(inner: S, scheduler: Scheduler) -> Self {
        Self { inner, scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl<S, Request> Service<Request> for SchedulerService<S>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Classify + Send + 'static,
    Request: Send + 'static,
{
    type Response = S::Response;
    type Error = SubmitError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(self.scheduler.submit(move || inner.oneshot(request)))
    }
}
