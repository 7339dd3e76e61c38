//! Query-window selection for time-entry extraction.

use crate::config::TimeEntryConfig;
use crate::descriptor::{EndpointRequest, Pagination, RecordsAt};
use crate::fetcher::Fetcher;
use crate::types::{Cursor, Record, TimeWindow, to_datetime, value_to_id};
use chrono::{DateTime, Duration, Utc};
use eyre::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lookback used when there is neither a cursor nor a configured start date.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Pick the window start and assignees without touching the network.
///
/// Start is the cursor bookmark if present, else the configured start date,
/// else `now` minus the default lookback. `members` is used only when no
/// assignees are configured. The end is left open.
pub fn select_window(
    config: &TimeEntryConfig,
    cursor: &Cursor,
    members: &[String],
    now: DateTime<Utc>,
) -> TimeWindow {
    let start = cursor
        .bookmark
        .as_ref()
        .and_then(to_datetime)
        .or(config.start_date)
        .unwrap_or_else(|| now - Duration::days(DEFAULT_LOOKBACK_DAYS));

    let assignee_ids = if config.assignees.is_empty() {
        members.to_vec()
    } else {
        config.assignees.clone()
    };

    TimeWindow {
        start,
        end: None,
        assignee_ids,
    }
}

/// Member ids of every team, read from a `/team` response.
pub fn members_by_team(teams: &[Record]) -> HashMap<String, Vec<String>> {
    teams
        .iter()
        .filter_map(|team| {
            let id = team.get("id").and_then(value_to_id)?;
            let members = team
                .get("members")
                .and_then(Value::as_array)
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|m| m.get("user").and_then(|u| u.get("id")).and_then(value_to_id))
                        .collect()
                })
                .unwrap_or_default();
            Some((id, members))
        })
        .collect()
}

/// Computes time-entry windows, looking up team members once per run.
pub struct TimeWindowSelector {
    config: TimeEntryConfig,
    fetcher: Arc<Fetcher>,
    members: Mutex<Option<HashMap<String, Vec<String>>>>,
}

impl TimeWindowSelector {
    pub fn new(config: TimeEntryConfig, fetcher: Arc<Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            members: Mutex::new(None),
        }
    }

    /// Window for `team_id` given the stream's cursor.
    pub async fn compute_window(&self, cursor: &Cursor, team_id: &str, now: DateTime<Utc>) -> Result<TimeWindow> {
        let members = if self.config.assignees.is_empty() {
            self.team_members(team_id).await?
        } else {
            Vec::new()
        };
        let window = select_window(&self.config, cursor, &members, now);
        log::info!(
            "Time entries for team {} from {} ({} assignees)",
            team_id,
            window.start.to_rfc3339(),
            window.assignee_ids.len()
        );
        Ok(window)
    }

    async fn team_members(&self, team_id: &str) -> Result<Vec<String>> {
        let mut members = self.members.lock().await;
        if members.is_none() {
            let request = EndpointRequest {
                path: "/team".to_string(),
                params: Vec::new(),
                records_at: RecordsAt::Array("teams".to_string()),
                pagination: Pagination::None,
            };
            let teams = self
                .fetcher
                .fetch_all(&request)
                .await
                .context("Failed to fetch team members")?;
            *members = Some(members_by_team(&teams));
        }
        Ok(members
            .as_ref()
            .and_then(|m| m.get(team_id))
            .cloned()
            .unwrap_or_default())
    }
}
