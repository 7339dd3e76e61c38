//! clickup-tap: incremental extraction of ClickUp project-management data.
//!
//! The engine walks a tree of dependent streams (teams → spaces → folders →
//! lists, tasks, time entries, ...), pages through each against a shared
//! rate-limited fetcher, merges custom-field definitions onto tasks, and
//! persists a per-stream cursor after every emitted page so the next run only
//! fetches what changed.
//!
//! # Example
//!
//! ```no_run
//! use clickup_tap::{HttpSource, MemorySink, SqliteCursorStore, Tap, TapConfig, clickup_registry};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> eyre::Result<()> {
//! let config = TapConfig::new("pk_12345");
//! let source = Arc::new(HttpSource::new(&config.base_url, &config.api_token)?);
//! let cursors = Arc::new(SqliteCursorStore::open(Path::new("state.db"))?);
//! let sink = Arc::new(MemorySink::new());
//!
//! let tap = Tap::new(&config, clickup_registry()?, source, cursors, sink.clone());
//! let report = tap.run(&["tasks".to_string()]).await?;
//! assert_eq!(report.exit_code(), 0);
//! # Ok(())
//! # }
//! ```

mod catalog;
mod config;
mod cursor;
mod descriptor;
mod error;
mod fetcher;
mod fields;
mod http;
mod rate;
mod sink;
mod source;
mod tap;
mod types;
mod walker;
mod window;

// Re-export public API
pub use catalog::{clickup_registry, clickup_streams};
pub use config::{RawConfig, TOKEN_ENV, TapConfig, TimeEntryConfig, parse_assignees, parse_start_date};
pub use cursor::{CursorStore, STATE_DB_FILE, SqliteCursorStore};
pub use descriptor::{
    Endpoint, EndpointRequest, Pagination, RecordsAt, Registry, SinceFilter, StreamDescriptor, StreamKind,
};
pub use error::TapError;
pub use fetcher::{Fetcher, Page};
pub use fields::{CustomFieldMerger, CustomFieldSet, DEFINITIONS_FIELD, ScopeKind, ScopeRef, overlay, scopes_for_task};
pub use http::HttpSource;
pub use rate::{RateBudget, RetryPolicy};
pub use sink::{JsonLinesSink, MemorySink, Message, OutputSink};
pub use source::{EntitySource, PageToken, RawPage, SourceError};
pub use tap::{RunReport, StreamOutcome, StreamStatus, Tap};
pub use types::{
    Cursor, MAX_BOUNDARY_KEYS, Record, ReplicationMode, TimeWindow, compare_replication_values, to_datetime,
};
pub use walker::{HierarchyWalker, StreamStats};
pub use window::{DEFAULT_LOOKBACK_DAYS, TimeWindowSelector, select_window};
