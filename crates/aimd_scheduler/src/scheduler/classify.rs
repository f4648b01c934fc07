//! Normalizes task errors into the fields the scheduler reacts to.

use std::fmt;

use http::{HeaderMap, HeaderValue, StatusCode, header::RETRY_AFTER};
use tower::timeout::error::Elapsed;

use super::http::HttpError;

/// How the scheduler reacts to a failed task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The backend asked us to slow down (429).
    Throttled,
    /// Server errors, timeouts, and failures without any HTTP status.
    Transient,
    /// Any other client error. Says nothing about backend load.
    ClientError,
}

impl FailureClass {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Throttled => "throttled",
            FailureClass::Transient => "transient",
            FailureClass::ClientError => "client_error",
        }
    }

    /// Whether the congestion controller should shrink its limits.
    pub const fn penalizes(&self) -> bool {
        !matches!(self, FailureClass::ClientError)
    }
}

/// The normalized view of a failed task: optional status, response headers, timeout flag.
#[derive(Clone, Debug, Default)]
pub struct Failure {
    status: Option<StatusCode>,
    headers: HeaderMap,
    timeout: bool,
}

impl Failure {
    /// A failure that carries no HTTP status, e.g. a connection reset.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn from_status(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            timeout: true,
            ..Self::default()
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_retry_after(mut self, value: HeaderValue) -> Self {
        self.headers.insert(RETRY_AFTER, value);
        self
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout
    }

    pub fn class(&self) -> FailureClass {
        match self.status {
            Some(status) if status == StatusCode::TOO_MANY_REQUESTS => FailureClass::Throttled,
            _ if self.timeout => FailureClass::Transient,
            None => FailureClass::Transient,
            Some(status) if status.is_server_error() => FailureClass::Transient,
            Some(_) => FailureClass::ClientError,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.timeout) {
            (_, true) => write!(f, "request timed out"),
            (Some(status), false) => write!(f, "request failed with status {}", status),
            (None, false) => write!(f, "request failed without a status"),
        }
    }
}

impl std::error::Error for Failure {}

/// Maps a task's error to a [`Failure`].
///
/// Backend adapters implement this for their error type so the scheduler can tell throttling
/// apart from infrastructure trouble and plain bad requests.
///
/// # Example
/// ```rust
/// use aimd_scheduler::scheduler::classify::{Classify, Failure, FailureClass};
/// use http::StatusCode;
///
/// #[derive(Debug)]
/// struct ApiError(u16);
///
/// impl Classify for ApiError {
///     fn classify(&self) -> Failure {
///         StatusCode::from_u16(self.0)
///             .map(Failure::from_status)
///             .unwrap_or_else(|_| Failure::unknown())
///     }
/// }
///
/// assert_eq!(ApiError(503).classify().class(), FailureClass::Transient);
/// ```
pub trait Classify {
    fn classify(&self) -> Failure;
}

impl Classify for Failure {
    fn classify(&self) -> Failure {
        self.clone()
    }
}

impl Classify for std::io::Error {
    fn classify(&self) -> Failure {
        if self.kind() == std::io::ErrorKind::TimedOut {
            Failure::timed_out()
        } else {
            Failure::unknown()
        }
    }
}

impl Classify for crate::Error {
    fn classify(&self) -> Failure {
        if let Some(failure) = self.downcast_ref::<Failure>() {
            failure.clone()
        } else if let Some(error) = self.downcast_ref::<HttpError>() {
            error.classify()
        } else if let Some(error) = self.downcast_ref::<reqwest::Error>() {
            error.classify()
        } else if self.downcast_ref::<Elapsed>().is_some() {
            Failure::timed_out()
        } else if let Some(error) = self.downcast_ref::<std::io::Error>() {
            error.classify()
        } else {
            Failure::unknown()
        }
    }
}
