//! A chat-completion client whose requests are paced by an adaptive [`Scheduler`].
//!
//! Every client built with the same API key shares one scheduler (see
//! [`aimd_scheduler::registry`]), so concurrency and rate limits are learned per credential, not
//! per client value.

use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use aimd_scheduler::registry;
use aimd_scheduler::scheduler::{
    Scheduler, SchedulerLayer, SchedulerService, SubmitError,
    classify::{Classify, Failure},
    http::HttpError,
    reqwest_integration::ReqwestService,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tower::{ServiceBuilder, ServiceExt, util::AndThen};
use tracing::{debug, info};

// --- Client Specific Error Type ---
#[derive(Debug)]
pub enum OpenAIClientError {
    Initialization(String),
    RequestBuild(String),
    /// The request was sent and failed: transport trouble, a timeout or a non-success status.
    Http(HttpError),
    /// The scheduler dropped the request before it produced a result.
    Abandoned,
    ResponseDeserialization {
        body_text: String,
        source: serde_json::Error,
    },
}

impl fmt::Display for OpenAIClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenAIClientError::Initialization(s) => {
                write!(f, "OpenAI Client Initialization Error: {}", s)
            }
            OpenAIClientError::RequestBuild(s) => write!(f, "Failed to build request: {}", s),
            OpenAIClientError::Http(e) => write!(f, "OpenAI request failed: {}", e),
            OpenAIClientError::Abandoned => {
                write!(f, "OpenAI request was abandoned by the scheduler")
            }
            OpenAIClientError::ResponseDeserialization { body_text, source } => write!(
                f,
                "Failed to deserialize OpenAI response: {}. Body: {:.100}",
                source, body_text
            ),
        }
    }
}

impl std::error::Error for OpenAIClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OpenAIClientError::Http(e) => Some(e),
            OpenAIClientError::ResponseDeserialization { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<SubmitError<HttpError>> for OpenAIClientError {
    fn from(error: SubmitError<HttpError>) -> Self {
        match error {
            SubmitError::Task(e) => OpenAIClientError::Http(e),
            SubmitError::Abandoned => OpenAIClientError::Abandoned,
        }
    }
}

/// Lets callers nest client calls inside their own scheduled tasks.
impl Classify for OpenAIClientError {
    fn classify(&self) -> Failure {
        match self {
            OpenAIClientError::Http(e) => e.classify(),
            _ => Failure::unknown(),
        }
    }
}

// --- Configuration for the Client ---
#[derive(Clone)]
pub struct OpenAIClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    pub reqwest_client: Option<reqwest::Client>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    /// Overrides the scheduler otherwise taken from the global registry for `api_key`.
    pub scheduler: Option<Scheduler>,
}

impl Default for OpenAIClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            reqwest_client: None,
            request_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            user_agent: Some(format!("rust-openai-client-aimd/{}", env!("CARGO_PKG_VERSION"))),
            scheduler: None,
        }
    }
}

// The API key stays out of logs.
impl fmt::Debug for OpenAIClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("custom_reqwest_client", &self.reqwest_client.is_some())
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("user_agent", &self.user_agent)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

// --- Request and Response Structs for Chat Completions ---
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: Option<u32>,
    pub total_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub created: u64,
    pub model: String,
    pub system_fingerprint: Option<String>,
    pub object: String,
    pub usage: Option<Usage>,
}

// --- The OpenAI Client ---

type ReadBody = Pin<Box<dyn Future<Output = Result<Bytes, HttpError>> + Send>>;

type ChatService = SchedulerService<AndThen<ReqwestService, fn(reqwest::Response) -> ReadBody>>;

/// Reads the body inside the scheduled task, so the request counts as in flight until it is
/// fully received.
fn read_body(response: reqwest::Response) -> ReadBody {
    Box::pin(async move {
        response.bytes().await.map_err(|error| {
            if error.is_timeout() {
                HttpError::Timeout
            } else {
                HttpError::Transport {
                    source: Box::new(error),
                }
            }
        })
    })
}

#[derive(Clone)]
pub struct OpenAIClient {
    service: ChatService,
    http_client: reqwest::Client,
    scheduler: Scheduler,
    pub config: Arc<OpenAIClientConfig>,
    chat_completions_url: String,
}

impl OpenAIClient {
    pub fn new(config: OpenAIClientConfig) -> Result<Self, OpenAIClientError> {
        if config.api_key.is_empty() {
            return Err(OpenAIClientError::Initialization(
                "API key cannot be empty".to_string(),
            ));
        }

        let http_client = match config.reqwest_client.clone() {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(config.request_timeout)
                .connect_timeout(config.connect_timeout)
                .build()
                .map_err(|e| {
                    OpenAIClientError::Initialization(format!(
                        "Failed to build default reqwest client: {}",
                        e
                    ))
                })?,
        };

        let scheduler = config
            .scheduler
            .clone()
            .unwrap_or_else(|| registry::global().get(&config.api_key));

        let service = ServiceBuilder::new()
            .layer(SchedulerLayer::new(scheduler.clone()))
            .and_then(read_body as fn(reqwest::Response) -> ReadBody)
            .service(ReqwestService::new_with_client(http_client.clone()));

        let chat_completions_url = format!(
            "{}/v1/chat/completions",
            config.base_url.trim_end_matches('/')
        );

        info!(target: "openai_client", base_url = %config.base_url, default_model = %config.default_model, "OpenAIClient initialized");
        debug!(target: "openai_client", client_config = ?config, "Full client configuration");

        Ok(Self {
            service,
            http_client,
            scheduler,
            config: Arc::new(config),
            chat_completions_url,
        })
    }

    /// The scheduler pacing this client's requests.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, OpenAIClientError> {
        debug!(target: "openai_client", model = %request.model, num_messages = request.messages.len(), "Submitting chat completion request");

        let mut builder = self
            .http_client
            .post(&self.chat_completions_url)
            .bearer_auth(&self.config.api_key)
            .json(&request);
        if let Some(ua) = &self.config.user_agent {
            builder = builder.header(reqwest::header::USER_AGENT, ua);
        }
        let http_request = builder
            .build()
            .map_err(|e| OpenAIClientError::RequestBuild(e.to_string()))?;

        // Boxed as a `Send` future so callers can spawn this one (works around a rustc
        // higher-ranked `Send` inference limitation on the tower `Oneshot` future).
        let response: Pin<Box<dyn Future<Output = Result<Bytes, SubmitError<HttpError>>> + Send>> =
            Box::pin(self.service.clone().oneshot(http_request));
        let body = response.await?;
        debug!(target: "openai_client", bytes = body.len(), "Received chat completion response");

        serde_json::from_slice::<ChatCompletionResponse>(&body).map_err(|source| {
            OpenAIClientError::ResponseDeserialization {
                body_text: String::from_utf8_lossy(&body).into_owned(),
                source,
            }
        })
    }

    pub async fn chat_completion_with_messages(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<ChatCompletionResponse, OpenAIClientError> {
        let request = ChatCompletionRequest {
            model: self.config.default_model.clone(),
            messages,
            temperature: None,
            max_tokens: None,
        };
        self.chat_completion(request).await
    }
}
