use tower::Layer;

use super::{Scheduler, service::SchedulerService};

/// Routes every call of the wrapped service through a [`Scheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerLayer {
    scheduler: Scheduler,
}

impl SchedulerLayer {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

impl<S> Layer<S> for SchedulerLayer {
    type Service = SchedulerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        SchedulerService::new(service, self.scheduler.clone())
    }
}
