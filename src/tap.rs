//! Top-level runner: wires the engine together and extracts streams in isolation.

use crate::config::TapConfig;
use crate::cursor::CursorStore;
use crate::descriptor::Registry;
use crate::error::TapError;
use crate::fetcher::Fetcher;
use crate::rate::{RateBudget, RetryPolicy};
use crate::sink::OutputSink;
use crate::source::EntitySource;
use crate::walker::{HierarchyWalker, StreamStats};
use eyre::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How one stream's run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStatus {
    Completed(StreamStats),
    Aborted { kind: String, error: String },
    Cancelled,
}

/// Outcome of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub stream: String,
    pub status: StreamStatus,
}

impl StreamOutcome {
    fn from_result(stream: String, result: Result<StreamStats>) -> Self {
        let status = match result {
            Ok(stats) => StreamStatus::Completed(stats),
            Err(err) => match TapError::find(&err) {
                Some(TapError::Cancelled) => StreamStatus::Cancelled,
                found => {
                    log::error!("Stream {} aborted: {:#}", stream, err);
                    StreamStatus::Aborted {
                        kind: found.map_or("other", TapError::kind).to_string(),
                        error: format!("{:#}", err),
                    }
                }
            },
        };
        Self { stream, status }
    }
}

/// Per-stream results of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub outcomes: Vec<StreamOutcome>,
}

impl RunReport {
    pub fn completed(&self) -> Vec<&StreamOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, StreamStatus::Completed(_)))
            .collect()
    }

    pub fn aborted(&self) -> Vec<&StreamOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, StreamStatus::Aborted { .. }))
            .collect()
    }

    pub fn outcome(&self, stream: &str) -> Option<&StreamOutcome> {
        self.outcomes.iter().find(|o| o.stream == stream)
    }

    /// Total records emitted by completed streams.
    pub fn records(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match &o.status {
                StreamStatus::Completed(stats) => stats.records,
                _ => 0,
            })
            .sum()
    }

    /// 0 when everything completed, 1 when any stream aborted on a
    /// non-configuration error, 2 for configuration aborts only, 130 when
    /// the run was cancelled.
    pub fn exit_code(&self) -> i32 {
        let aborted = self.aborted();
        if aborted
            .iter()
            .any(|o| !matches!(&o.status, StreamStatus::Aborted { kind, .. } if kind == "configuration"))
        {
            1
        } else if !aborted.is_empty() {
            2
        } else if self.outcomes.iter().any(|o| o.status == StreamStatus::Cancelled) {
            130
        } else {
            0
        }
    }
}

/// The extraction engine for one configured source.
pub struct Tap {
    registry: Arc<Registry>,
    walker: HierarchyWalker,
    stream_concurrency: usize,
}

impl Tap {
    pub fn new(
        config: &TapConfig,
        registry: Registry,
        source: Arc<dyn EntitySource>,
        cursors: Arc<dyn CursorStore>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let policy = RetryPolicy {
            max_retries: config.max_retries,
            base: config.backoff_base,
            max: config.backoff_max,
            ..RetryPolicy::default()
        };
        let fetcher = Arc::new(Fetcher::new(
            source,
            RateBudget::per_minute(config.requests_per_minute),
            policy,
        ));
        let registry = Arc::new(registry);
        let walker = HierarchyWalker::new(
            Arc::clone(&registry),
            fetcher,
            cursors,
            sink,
            config.time_entries.clone(),
        )
        .with_parent_concurrency(config.parent_concurrency);

        Self {
            registry,
            walker,
            stream_concurrency: config.stream_concurrency.max(1),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Flag that stops every stream at its next page boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.walker.stop_handle()
    }

    pub fn stop(&self) {
        self.walker.stop_handle().store(true, Ordering::SeqCst);
    }

    /// Run `selection` (every registered stream when empty).
    ///
    /// Unknown stream names fail the whole run before anything is fetched.
    /// Otherwise each stream succeeds or fails on its own.
    pub async fn run(&self, selection: &[String]) -> Result<RunReport> {
        let names: Vec<String> = if selection.is_empty() {
            self.registry.names().into_iter().map(String::from).collect()
        } else {
            for name in selection {
                self.registry.require(name)?;
            }
            selection.to_vec()
        };

        log::info!("Extracting {} streams", names.len());

        let mut outcomes: Vec<(usize, StreamOutcome)> = stream::iter(names.into_iter().enumerate())
            .map(|(i, name)| async move {
                let result = self.walker.walk(&name).await;
                (i, StreamOutcome::from_result(name, result))
            })
            .buffer_unordered(self.stream_concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|(i, _)| *i);

        Ok(RunReport {
            outcomes: outcomes.into_iter().map(|(_, o)| o).collect(),
        })
    }
}
