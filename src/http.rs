//! HTTP binding of the entity source for the ClickUp REST API.

use crate::descriptor::{EndpointRequest, Pagination, RecordsAt};
use crate::source::{EntitySource, PageToken, RawPage, SourceError};
use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use std::time::Duration;

/// Request timeout for a single page.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Longest error body kept in messages.
const MAX_ERROR_BODY: usize = 500;

/// Entity source backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    base_url: String,
    api_token: String,
    client: Client,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl EntitySource for HttpSource {
    async fn request(&self, endpoint: &EndpointRequest, token: Option<&PageToken>) -> Result<RawPage, SourceError> {
        let url = self.url(&endpoint.path);
        let page = match endpoint.pagination {
            Pagination::None => None,
            Pagination::PageNumber => Some(
                token
                    .map(|t| t.as_str().parse::<u64>().unwrap_or(0))
                    .unwrap_or(0),
            ),
        };

        let mut query = endpoint.params.clone();
        if let Some(page) = page {
            query.push(("page".to_string(), page.to_string()));
        }

        log::debug!("GET {} {:?}", url, query);
        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, &self.api_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| SourceError::Transport(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, truncate(body)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Transport(format!("invalid JSON from {}: {}", url, e)))?;

        let next_token = page.and_then(|page| next_page(&body, &endpoint.records_at, page));
        Ok(RawPage { body, next_token })
    }
}

/// Map a non-success status to the source error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, message: String) -> SourceError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        SourceError::RateLimited { retry_after }
    } else if status.is_server_error() {
        SourceError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        SourceError::Client {
            status: status.as_u16(),
            message,
        }
    }
}

/// Next page number, unless this page is empty or marked last.
fn next_page(body: &Value, records_at: &RecordsAt, page: u64) -> Option<PageToken> {
    if body.get("last_page").and_then(Value::as_bool) == Some(true) {
        return None;
    }
    let count = match records_at {
        RecordsAt::Array(key) => body.get(key).and_then(Value::as_array).map_or(0, Vec::len),
        RecordsAt::Object(_) => 0,
    };
    (count > 0).then(|| PageToken((page + 1).to_string()))
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("... (truncated)");
    }
    body
}
