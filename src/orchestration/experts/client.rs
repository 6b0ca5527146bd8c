// Request/response transport to expert services

use crate::orchestration::types::{Expert, RouteRequest};
use async_trait::async_trait;
use serde::Deserialize;

/// Successful reply from an expert
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertReply {
    pub response: String,
    pub details: Option<serde_json::Value>,
}

impl ExpertReply {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            details: None,
        }
    }
}

/// Invokes one expert with one request
#[async_trait]
pub trait ExpertClient: Send + Sync {
    async fn invoke(&self, expert: &Expert, request: &RouteRequest) -> Result<ExpertReply, ExpertCallError>;
}

/// Calls `POST {endpoint}/process` with the request as JSON.
///
/// No timeout is set on the client itself; the dispatcher owns the timers and
/// cancels the call by dropping its future.
pub struct HttpExpertClient {
    client: reqwest::Client,
}

/// Body an expert returns from `/process`
#[derive(Deserialize)]
struct ProcessReply {
    response: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

impl HttpExpertClient {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpExpertClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExpertClient for HttpExpertClient {
    async fn invoke(&self, expert: &Expert, request: &RouteRequest) -> Result<ExpertReply, ExpertCallError> {
        let url = format!("{}/process", expert.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ExpertCallError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExpertCallError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let reply: ProcessReply = response
            .json()
            .await
            .map_err(|e| ExpertCallError::Protocol(format!("malformed response body: {}", e)))?;

        Ok(ExpertReply {
            response: reply.response,
            details: reply.details,
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ExpertCallError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("expert returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ExpertCallError {
    /// Transport faults and server-side statuses may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ExpertCallError::Transport(_) => true,
            ExpertCallError::Status { status, .. } => *status >= 500 || *status == 429,
            ExpertCallError::Protocol(_) => false,
        }
    }
}
