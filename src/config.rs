//! Tap configuration: file loading, environment override, validation.

use crate::error::TapError;
use chrono::{DateTime, NaiveDate, Utc};
use eyre::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `api_token` from the config file.
pub const TOKEN_ENV: &str = "CLICKUP_API_TOKEN";

/// Default ClickUp REST base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.clickup.com/api/v2";

/// Raw configuration as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    pub api_token: Option<String>,
    /// Comma-separated user ids.
    pub time_entry_assignees: Option<String>,
    /// ISO-8601 start for the first time-entry window.
    pub time_entry_start_date: Option<String>,
    pub base_url: Option<String>,
    pub requests_per_minute: Option<usize>,
    pub max_retries: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub parent_concurrency: Option<usize>,
    pub stream_concurrency: Option<usize>,
}

/// Settings the time-window selector needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeEntryConfig {
    pub assignees: Vec<String>,
    pub start_date: Option<DateTime<Utc>>,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct TapConfig {
    pub api_token: String,
    pub base_url: String,
    pub time_entries: TimeEntryConfig,
    pub requests_per_minute: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub parent_concurrency: usize,
    pub stream_concurrency: usize,
}

impl TapConfig {
    /// Config with defaults for everything but the token.
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            time_entries: TimeEntryConfig::default(),
            requests_per_minute: 100,
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            parent_concurrency: 1,
            stream_concurrency: 4,
        }
    }

    /// Load from a JSON or YAML file, applying the environment token override.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let raw: RawConfig = serde_yaml::from_str(&text).map_err(|e| {
            eyre::eyre!(TapError::Configuration(format!("invalid config file {}: {}", path.display(), e)))
        })?;
        Self::from_raw(raw, std::env::var(TOKEN_ENV).ok())
    }

    /// Validate raw settings. `env_token`, when set and non-empty, wins over the file.
    pub fn from_raw(raw: RawConfig, env_token: Option<String>) -> Result<Self> {
        let api_token = env_token
            .filter(|t| !t.trim().is_empty())
            .or(raw.api_token)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| config_error(format!("api_token is required (or set {})", TOKEN_ENV)))?;

        let mut config = Self::new(api_token);

        if let Some(list) = raw.time_entry_assignees.as_deref() {
            config.time_entries.assignees = parse_assignees(list)?;
        }
        if let Some(start) = raw.time_entry_start_date.as_deref() {
            config.time_entries.start_date = Some(parse_start_date(start)?);
        }
        if let Some(url) = raw.base_url {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(rpm) = raw.requests_per_minute {
            if rpm == 0 {
                return Err(config_error("requests_per_minute must be positive".to_string()));
            }
            config.requests_per_minute = rpm;
        }
        if let Some(retries) = raw.max_retries {
            config.max_retries = retries;
        }
        if let Some(ms) = raw.backoff_base_ms {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.backoff_max_ms {
            config.backoff_max = Duration::from_millis(ms);
        }
        if config.backoff_max < config.backoff_base {
            return Err(config_error("backoff_max_ms must be at least backoff_base_ms".to_string()));
        }
        if let Some(n) = raw.parent_concurrency {
            config.parent_concurrency = n.max(1);
        }
        if let Some(n) = raw.stream_concurrency {
            config.stream_concurrency = n.max(1);
        }

        Ok(config)
    }
}

/// Parse a comma-separated list of numeric user ids, ignoring blanks.
pub fn parse_assignees(list: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(config_error(format!("invalid assignee id '{}'", part)));
        }
        if !ids.iter().any(|id| id == part) {
            ids.push(part.to_string());
        }
    }
    Ok(ids)
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_start_date(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        && let Some(dt) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(dt.and_utc());
    }
    Err(config_error(format!("invalid time_entry_start_date '{}'", value)))
}

fn config_error(msg: String) -> eyre::Report {
    eyre::eyre!(TapError::Configuration(msg))
}
