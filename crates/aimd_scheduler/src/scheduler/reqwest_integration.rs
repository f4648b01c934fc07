use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::StatusCode;
use tower::Service;

use super::classify::{Classify, Failure};
use super::http::HttpError;

/// A `tower::Service` wrapper for `reqwest::Client`.
///
/// Non-success responses are turned into [`HttpError::Status`] with their headers and body,
/// so the scheduler sees `Retry-After` and the caller still gets the server's message.
#[derive(Clone, Debug)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Default for ReqwestService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<reqwest::Request> for ReqwestService {
    type Response = reqwest::Response;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: reqwest::Request) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let response = client.execute(request).await.map_err(map_reqwest_error)?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let headers = response.headers().clone();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Could not read error body".to_string());

            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                warn!(%status, error_body = %body, "Server error or rate limited.");
            } else {
                debug!(%status, error_body = %body, "Request rejected by server.");
            }

            Err(HttpError::Status {
                status,
                headers,
                body,
            })
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        warn!(%error, "Request timed out.");
        HttpError::Timeout
    } else if error.is_builder() {
        HttpError::InvalidRequest {
            details: error.to_string(),
        }
    } else {
        debug!(%error, "Transport error.");
        HttpError::Transport {
            source: Box::new(error),
        }
    }
}

impl Classify for reqwest::Error {
    fn classify(&self) -> Failure {
        if self.is_timeout() {
            Failure::timed_out()
        } else if let Some(status) = self.status() {
            Failure::from_status(status)
        } else {
            Failure::unknown()
        }
    }
}
