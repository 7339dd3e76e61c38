//! Core data types for the extraction engine.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// One emitted entity: an ordered mapping of field name to value.
pub type Record = Map<String, Value>;

/// How a stream decides what to fetch on each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMode {
    /// Always fetch everything; never touches a cursor.
    FullTable,
    /// Fetch only records whose replication key is at or past the bookmark.
    Incremental,
}

/// Most primary keys a cursor remembers at its bookmark. Records past the
/// cap that share the bookmark value may be emitted again on the next run.
pub const MAX_BOUNDARY_KEYS: usize = 1000;

/// Persisted replication progress for one stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cursor {
    /// Stream this cursor belongs to
    pub stream: String,

    /// Highest replication-key value emitted so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<Value>,

    /// Last parent whose children were fully emitted during an unfinished run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_context: Option<String>,

    /// Bookmark in effect when the unfinished run began
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_floor: Option<Value>,

    /// Primary keys of emitted records whose replication value equals the bookmark
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boundary_keys: Vec<String>,
}

impl Cursor {
    /// A cursor with no recorded progress.
    pub fn empty(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            bookmark: None,
            parent_context: None,
            run_floor: None,
            boundary_keys: Vec::new(),
        }
    }

    /// True when an earlier run of a fan-out stream stopped partway through.
    pub fn is_in_progress(&self) -> bool {
        self.parent_context.is_some()
    }

    /// Account for an emitted record. A newer value raises the bookmark and
    /// resets the boundary keys. An equal value adds `key` to them while
    /// fewer than [`MAX_BOUNDARY_KEYS`] are held. Returns whether the cursor changed.
    pub fn observe(&mut self, value: &Value, key: &str) -> bool {
        let order = match &self.bookmark {
            None => Ordering::Greater,
            Some(current) => compare_replication_values(value, current),
        };
        match order {
            Ordering::Greater => {
                self.bookmark = Some(value.clone());
                self.boundary_keys = vec![key.to_string()];
                true
            }
            Ordering::Equal
                if self.boundary_keys.len() < MAX_BOUNDARY_KEYS && !self.boundary_keys.iter().any(|k| k == key) =>
            {
                self.boundary_keys.push(key.to_string());
                true
            }
            _ => false,
        }
    }

    /// True if a record with `value` and `key` was already emitted at the bookmark.
    pub fn seen_at_boundary(&self, value: &Value, key: &str) -> bool {
        match &self.bookmark {
            Some(current) => {
                compare_replication_values(value, current) == Ordering::Equal
                    && self.boundary_keys.iter().any(|k| k == key)
            }
            None => false,
        }
    }
}

/// Query window for time-entry extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub assignee_ids: Vec<String>,
}

impl TimeWindow {
    /// Query parameters understood by the time-entries endpoint.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("start_date".to_string(), self.start.timestamp_millis().to_string())];
        if let Some(end) = self.end {
            params.push(("end_date".to_string(), end.timestamp_millis().to_string()));
        }
        if !self.assignee_ids.is_empty() {
            params.push(("assignee".to_string(), self.assignee_ids.join(",")));
        }
        params
    }
}

/// Order two replication values.
///
/// Numbers and numeric strings compare numerically (ClickUp reports epoch
/// milliseconds as strings), RFC 3339 strings compare as instants, anything
/// else falls back to string order.
pub fn compare_replication_values(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    if let (Some(x), Some(y)) = (as_rfc3339(a), as_rfc3339(b)) {
        return x.cmp(&y);
    }
    value_text(a).cmp(&value_text(b))
}

/// Interpret a replication value as an instant, if it looks like one.
pub fn to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = as_number(value) {
        return Utc.timestamp_millis_opt(ms as i64).single();
    }
    as_rfc3339(value)
}

/// Render a scalar value as an identifier string.
pub fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_rfc3339(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
