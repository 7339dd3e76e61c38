//! Rate-limited, retrying page fetcher shared by every stream.

use crate::descriptor::{EndpointRequest, RecordsAt};
use crate::error::TapError;
use crate::rate::{RateBudget, RetryPolicy};
use crate::source::{EntitySource, PageToken, SourceError};
use crate::types::Record;
use eyre::Result;
use serde_json::Value;
use std::sync::Arc;

/// Records decoded from one page plus the token for the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    pub next_token: Option<PageToken>,
}

/// The single gateway to the entity source.
pub struct Fetcher {
    source: Arc<dyn EntitySource>,
    budget: RateBudget,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(source: Arc<dyn EntitySource>, budget: RateBudget, policy: RetryPolicy) -> Self {
        Self { source, budget, policy }
    }

    /// Fetch one page.
    ///
    /// Every attempt spends one unit of the shared budget. Rate-limit
    /// signals, server errors and transport failures are retried with
    /// backoff up to `max_retries` times, then surface as
    /// [`TapError::TransientFetch`]. Client errors fail immediately with
    /// [`TapError::Fetch`].
    pub async fn fetch_page(&self, request: &EndpointRequest, token: Option<&PageToken>) -> Result<Page> {
        let mut retry = 0;
        loop {
            self.budget.acquire().await;
            match self.source.request(request, token).await {
                Ok(raw) => {
                    let records = extract_records(&raw.body, &request.records_at).map_err(|message| {
                        eyre::eyre!(TapError::Fetch {
                            status: 200,
                            message: format!("{}: {}", request.path, message),
                        })
                    })?;
                    return Ok(Page {
                        records,
                        next_token: raw.next_token,
                    });
                }
                Err(SourceError::Client { status, message }) => {
                    log::error!("GET {} failed with {}: {}", request.path, status, message);
                    return Err(eyre::eyre!(TapError::Fetch { status, message }));
                }
                Err(err) => {
                    if retry >= self.policy.max_retries {
                        log::error!("GET {} giving up after {} attempts: {}", request.path, retry + 1, err);
                        return Err(eyre::eyre!(TapError::TransientFetch {
                            attempts: retry + 1,
                            message: err.to_string(),
                        }));
                    }
                    let hint = match &err {
                        SourceError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = self.policy.delay_with_hint(retry, hint);
                    log::warn!(
                        "GET {} failed ({}), retry {}/{} in {:?}",
                        request.path,
                        err,
                        retry + 1,
                        self.policy.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    /// Fetch every page of `request` in order.
    pub async fn fetch_all(&self, request: &EndpointRequest) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut token = None;
        loop {
            let page = self.fetch_page(request, token.as_ref()).await?;
            records.extend(page.records);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(records),
            }
        }
    }
}

/// Pull the record list out of a raw body.
fn extract_records(body: &Value, records_at: &RecordsAt) -> Result<Vec<Record>, String> {
    match records_at {
        RecordsAt::Array(key) => match body.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map.clone()),
                    other => Err(format!("expected object in '{}', found {}", key, other)),
                })
                .collect(),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(format!("expected array at '{}', found {}", key, other)),
        },
        RecordsAt::Object(key) => match body.get(key) {
            Some(Value::Object(map)) => Ok(vec![map.clone()]),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(format!("expected object at '{}', found {}", key, other)),
        },
    }
}
