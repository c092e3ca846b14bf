use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw inputs handed to the summarization collaborator.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeRequest {
    pub task_description: String,
    pub tool_calls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
    pub max_tokens: u32,
}

/// Collaborator response; `success` gates everything else.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeResponse {
    pub success: bool,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Ways the summarization collaborator can fail; all of them are
/// recovered locally by falling back to the template strategy.
#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("summarizer returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid summarizer response: {0}")]
    InvalidResponse(String),
}

/// Boundary to the external summarization service.
///
/// Implementations are treated as unreliable by construction; callers
/// fall back to the template strategy on any error.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: SummarizeRequest) -> Result<SummarizeResponse, SummarizeError>;
}

/// Endpoint, credentials, and timeout for the remote summarizer.
#[derive(Debug, Clone)]
pub struct HttpSummarizerConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
}

/// HTTP client for a remote summarization service.
#[derive(Debug, Clone)]
pub struct HttpSummarizer {
    client: reqwest::Client,
    config: HttpSummarizerConfig,
}

impl HttpSummarizer {
    pub fn new(config: HttpSummarizerConfig) -> Result<Self, SummarizeError> {
        if config.endpoint.trim().is_empty() {
            return Err(SummarizeError::InvalidResponse(
                "summarizer endpoint is empty".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            headers.insert(
                "authorization",
                HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
                    SummarizeError::InvalidResponse(format!("invalid api key header: {e}"))
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, request: SummarizeRequest) -> Result<SummarizeResponse, SummarizeError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(SummarizeError::HttpStatus { status, body });
        }

        let parsed: SummarizeResponse = serde_json::from_str(&body)
            .map_err(|e| SummarizeError::InvalidResponse(format!("malformed body: {e}")))?;
        Ok(parsed)
    }
}
