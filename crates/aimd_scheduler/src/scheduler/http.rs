use http::{HeaderMap, StatusCode};
use snafu::Snafu;

use super::classify::{Classify, Failure};
use crate::Error as CrateError;

/// A generic error enumeration for HTTP backends.
///
/// Client integrations (like [`super::reqwest_integration::ReqwestService`]) map their own
/// failures onto these variants; the scheduler then classifies them through [`Classify`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// An error occurred during the transport of the request (e.g., network issue, DNS).
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The request itself was malformed or invalid before sending.
    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// The server responded with a non-success status. Headers are kept so that
    /// `Retry-After` hints survive.
    #[snafu(display("HTTP error response (status {}): {}", status, body))]
    Status {
        status: StatusCode,
        headers: HeaderMap,
        body: String,
    },

    /// A timeout occurred.
    #[snafu(display("HTTP request timed out"))]
    Timeout,
}

impl HttpError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Classify for HttpError {
    fn classify(&self) -> Failure {
        match self {
            HttpError::Status {
                status, headers, ..
            } => Failure::from_status(*status).with_headers(headers.clone()),
            HttpError::Timeout => Failure::timed_out(),
            HttpError::Transport { .. } | HttpError::InvalidRequest { .. } => Failure::unknown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, header::RETRY_AFTER};

    use super::*;
    use crate::scheduler::classify::FailureClass;

    #[test]
    fn status_errors_keep_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        let error = HttpError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body: "slow down".to_string(),
        };

        let failure = error.classify();
        assert_eq!(failure.class(), FailureClass::Throttled);
        assert_eq!(failure.headers()[RETRY_AFTER], "2");
        assert_eq!(error.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn transport_and_timeout_are_transient() {
        let transport = HttpError::Transport {
            source: "connection refused".into(),
        };
        assert_eq!(transport.classify().class(), FailureClass::Transient);
        assert_eq!(transport.status(), None);
        assert!(HttpError::Timeout.classify().is_timeout());
    }
}
