use std::{future::Future, pin::Pin, sync::Once};

use tokio::time::Duration;

use crate::scheduler::classify::Failure;

static TRACE: Once = Once::new();

pub(crate) fn trace_init() {
    TRACE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                std::env::var("TEST_LOG").unwrap_or_else(|_| "aimd_scheduler=debug".to_string()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub(crate) type TestTask =
    Pin<Box<dyn Future<Output = Result<Duration, Failure>> + Send + 'static>>;

/// A task that sleeps for `delay` and then returns the delay.
pub(crate) fn sleeping_ok(delay: Duration) -> impl FnOnce() -> TestTask + Send + 'static {
    move || {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(delay)
        })
    }
}

/// A task that fails immediately with the given failure.
pub(crate) fn failing(failure: Failure) -> impl FnOnce() -> TestTask + Send + 'static {
    move || Box::pin(async move { Err(failure) })
}
