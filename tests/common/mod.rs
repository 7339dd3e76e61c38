//! Shared test infrastructure for clickup-tap integration tests.
//!
//! Provides a scripted in-memory entity source and a TestEnv helper that
//! wires it to a temporary cursor database and an in-memory sink.

#![allow(dead_code)]

use async_trait::async_trait;
use clickup_tap::{
    Cursor, CursorStore, Endpoint, EndpointRequest, EntitySource, Fetcher, HierarchyWalker, MemorySink, PageToken,
    RateBudget, RawPage, Record, RecordsAt, Registry, RetryPolicy, STATE_DB_FILE, SourceError, SqliteCursorStore,
    StreamDescriptor, StreamStats, Tap, TapConfig, TimeEntryConfig,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

/// One request seen by the scripted source.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub path: String,
    pub params: Vec<(String, String)>,
    pub token: Option<String>,
    pub at: Instant,
    /// Messages the watched sink held when the request arrived.
    pub emitted_before: usize,
}

impl RequestLog {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Answers requests from canned pages keyed by path.
///
/// Page tokens are page indexes. Queued failures for a path are returned,
/// one per request, before any page is served.
#[derive(Default)]
pub struct ScriptedSource {
    pages: Mutex<HashMap<String, Vec<Value>>>,
    failures: Mutex<Vec<(String, Option<usize>, SourceError)>>,
    log: Mutex<Vec<RequestLog>>,
    watched: Mutex<Option<Arc<MemorySink>>>,
    strict_after: Mutex<HashMap<String, (String, String)>>,
    stop_hooks: Mutex<Vec<(String, usize, Arc<AtomicBool>)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a page of `records` under `key` for `path`.
    pub fn page(&self, path: &str, key: &str, records: Vec<Value>) {
        let mut body = serde_json::Map::new();
        body.insert(key.to_string(), Value::Array(records));
        self.body(path, Value::Object(body));
    }

    /// Append a raw page body for `path`.
    pub fn body(&self, path: &str, body: Value) {
        self.pages
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push(body);
    }

    /// Drop every page scripted for `path`.
    pub fn clear(&self, path: &str) {
        self.pages.lock().unwrap().remove(path);
    }

    /// Fail the next request for `path` with `error`.
    pub fn fail(&self, path: &str, error: SourceError) {
        self.failures.lock().unwrap().push((path.to_string(), None, error));
    }

    /// Fail the next request for page `index` of `path` with `error`.
    pub fn fail_page(&self, path: &str, index: usize, error: SourceError) {
        self.failures.lock().unwrap().push((path.to_string(), Some(index), error));
    }

    pub fn fail_times(&self, path: &str, error: SourceError, times: usize) {
        for _ in 0..times {
            self.fail(path, error.clone());
        }
    }

    /// Serve only records of `path` whose `field` is strictly greater than
    /// the request's `param`, the way ClickUp treats `_gt` parameters.
    pub fn filter_after(&self, path: &str, param: &str, field: &str) {
        self.strict_after
            .lock()
            .unwrap()
            .insert(path.to_string(), (param.to_string(), field.to_string()));
    }

    /// Raise `flag` while serving page `index` of `path`.
    pub fn stop_after_page(&self, path: &str, index: usize, flag: Arc<AtomicBool>) {
        self.stop_hooks.lock().unwrap().push((path.to_string(), index, flag));
    }

    /// Record how many messages `sink` holds at each request.
    pub fn watch(&self, sink: Arc<MemorySink>) {
        *self.watched.lock().unwrap() = Some(sink);
    }

    pub fn requests(&self) -> Vec<RequestLog> {
        self.log.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }

    pub fn requests_for(&self, path: &str) -> Vec<RequestLog> {
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }

    pub fn reset_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

#[async_trait]
impl EntitySource for ScriptedSource {
    async fn request(&self, endpoint: &EndpointRequest, token: Option<&PageToken>) -> Result<RawPage, SourceError> {
        let emitted_before = self
            .watched
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |sink| sink.messages().len());
        self.log.lock().unwrap().push(RequestLog {
            path: endpoint.path.clone(),
            params: endpoint.params.clone(),
            token: token.map(|t| t.0.clone()),
            at: Instant::now(),
            emitted_before,
        });

        let index: usize = token.map_or(0, |t| t.0.parse().unwrap());
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(pos) = failures
                .iter()
                .position(|(path, page, _)| *path == endpoint.path && page.is_none_or(|p| p == index))
            {
                return Err(failures.remove(pos).2);
            }
        }

        let pages = self.pages.lock().unwrap();
        let Some(bodies) = pages.get(&endpoint.path) else {
            return Ok(RawPage {
                body: json!({}),
                next_token: None,
            });
        };
        let next_token = (index + 1 < bodies.len()).then(|| PageToken((index + 1).to_string()));
        let mut body = bodies[index].clone();

        if let Some((param, field)) = self.strict_after.lock().unwrap().get(&endpoint.path)
            && let Some(floor) = endpoint.param(param).map(|v| v.parse::<i64>().unwrap())
            && let Value::Object(map) = &mut body
        {
            for value in map.values_mut() {
                if let Value::Array(items) = value {
                    items.retain(|item| {
                        item.get(field)
                            .and_then(Value::as_str)
                            .and_then(|v| v.parse::<i64>().ok())
                            .is_some_and(|v| v > floor)
                    });
                }
            }
        }

        for (path, page, flag) in self.stop_hooks.lock().unwrap().iter() {
            if *path == endpoint.path && *page == index {
                flag.store(true, Ordering::SeqCst);
            }
        }

        Ok(RawPage { body, next_token })
    }
}

/// Build a JSON object record.
pub fn record(value: Value) -> Record {
    value.as_object().expect("record must be an object").clone()
}

/// Retry policy with short, deterministic delays.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base: Duration::from_millis(10),
        max: Duration::from_millis(200),
        jitter: 0.0,
    }
}

/// Small registry used by most tests:
///
/// - `teams` (root, full table)
/// - `events` (root, incremental on `date_updated`)
/// - `goals` (child of teams, incremental on `date_updated`)
/// - `spaces` (child of teams), `folders` (child of spaces)
pub fn test_registry() -> Registry {
    Registry::new(vec![
        StreamDescriptor::new("teams", Endpoint::new("/team", RecordsAt::Array("teams".into()))),
        StreamDescriptor::new("events", Endpoint::new("/event", RecordsAt::Array("events".into())).since("since"))
            .incremental("date_updated"),
        StreamDescriptor::new("goals", Endpoint::new("/team/{team_id}/goal", RecordsAt::Array("goals".into())))
            .child_of("teams", "team_id")
            .incremental("date_updated"),
        StreamDescriptor::new("spaces", Endpoint::new("/team/{team_id}/space", RecordsAt::Array("spaces".into())))
            .child_of("teams", "team_id"),
        StreamDescriptor::new("folders", Endpoint::new("/space/{space_id}/folder", RecordsAt::Array("folders".into())))
            .child_of("spaces", "space_id"),
    ])
    .expect("Failed to build test registry")
}

/// Test environment with automatic cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub source: Arc<ScriptedSource>,
    pub cursors: Arc<SqliteCursorStore>,
    pub sink: Arc<MemorySink>,
}

impl TestEnv {
    /// Create a new environment with an empty cursor database.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cursors = SqliteCursorStore::open(&temp_dir.path().join(STATE_DB_FILE)).expect("Failed to open cursor store");
        let sink = Arc::new(MemorySink::new());
        let source = Arc::new(ScriptedSource::new());
        source.watch(Arc::clone(&sink));
        Self {
            temp_dir,
            source,
            cursors: Arc::new(cursors),
            sink,
        }
    }

    /// Start the next run with an empty sink and request log.
    pub fn next_run(&mut self) {
        self.sink = Arc::new(MemorySink::new());
        self.source.watch(Arc::clone(&self.sink));
        self.source.reset_log();
    }

    /// Reopen the cursor database from disk, as a fresh process would.
    pub fn reopen_cursors(&mut self) {
        let path = self.temp_dir.path().join(STATE_DB_FILE);
        self.cursors = Arc::new(SqliteCursorStore::open(&path).expect("Failed to reopen cursor store"));
    }

    pub fn fetcher(&self) -> Arc<Fetcher> {
        self.fetcher_with(fast_policy())
    }

    pub fn fetcher_with(&self, policy: RetryPolicy) -> Arc<Fetcher> {
        Arc::new(Fetcher::new(
            self.source.clone(),
            RateBudget::new(10_000, Duration::from_secs(60)),
            policy,
        ))
    }

    pub fn walker(&self, registry: Registry) -> HierarchyWalker {
        self.walker_with(registry, TimeEntryConfig::default(), 1)
    }

    pub fn walker_with(&self, registry: Registry, time_entries: TimeEntryConfig, parent_concurrency: usize) -> HierarchyWalker {
        HierarchyWalker::new(
            Arc::new(registry),
            self.fetcher(),
            self.cursors.clone(),
            self.sink.clone(),
            time_entries,
        )
        .with_parent_concurrency(parent_concurrency)
    }

    /// Config with millisecond backoff so failing streams finish quickly.
    pub fn config(&self) -> TapConfig {
        let mut config = TapConfig::new("pk_test");
        config.backoff_base = Duration::from_millis(1);
        config.backoff_max = Duration::from_millis(5);
        config.requests_per_minute = 10_000;
        config
    }

    pub fn tap(&self, registry: Registry) -> Tap {
        self.tap_with(&self.config(), registry)
    }

    pub fn tap_with(&self, config: &TapConfig, registry: Registry) -> Tap {
        Tap::new(config, registry, self.source.clone(), self.cursors.clone(), self.sink.clone())
    }

    /// Walk `stream` to completion with the test registry.
    pub async fn walk(&self, stream: &str) -> StreamStats {
        self.walker(test_registry())
            .walk(stream)
            .await
            .expect("Failed to walk stream")
    }

    pub fn cursor(&self, stream: &str) -> Cursor {
        self.cursors.load(stream).expect("Failed to load cursor")
    }

    pub fn save_cursor(&self, cursor: &Cursor) {
        self.cursors.save(cursor).expect("Failed to save cursor");
    }

    /// Ids of the records emitted for `stream`, in emission order.
    pub fn emitted_ids(&self, stream: &str) -> Vec<String> {
        self.sink
            .records(stream)
            .iter()
            .map(|r| match r.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            })
            .collect()
    }

    /// Assert that `stream`'s saved bookmark equals `expected`.
    pub fn assert_bookmark(&self, stream: &str, expected: Value) {
        let cursor = self.cursor(stream);
        assert_eq!(
            cursor.bookmark,
            Some(expected.clone()),
            "Expected {} bookmark {}, found {:?}",
            stream,
            expected,
            cursor.bookmark
        );
    }
}
