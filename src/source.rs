//! The entity-source capability the engine extracts from.

use crate::descriptor::EndpointRequest;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Opaque pagination position handed back by the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(pub String);

impl PageToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One undecoded response page.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub body: Value,
    pub next_token: Option<PageToken>,
}

/// How a single request failed.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Explicit "too many requests" signal.
    RateLimited { retry_after: Option<Duration> },
    /// 5xx-class failure.
    Server { status: u16, message: String },
    /// 4xx-class failure other than rate limiting.
    Client { status: u16, message: String },
    /// The request never produced a response.
    Transport(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::Client { .. })
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::RateLimited { retry_after: Some(d) } => {
                write!(f, "rate limited (retry after {}s)", d.as_secs())
            }
            SourceError::RateLimited { retry_after: None } => write!(f, "rate limited"),
            SourceError::Server { status, message } => write!(f, "server error {}: {}", status, message),
            SourceError::Client { status, message } => write!(f, "client error {}: {}", status, message),
            SourceError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// Network (or fake) binding that answers endpoint requests page by page.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn request(&self, endpoint: &EndpointRequest, token: Option<&PageToken>) -> Result<RawPage, SourceError>;
}
