//! Hierarchy walker: drives extraction of one stream through its ancestors.
//!
//! Parents are paged lazily, one page at a time, and each parent's children
//! are fetched before the next parent is visited (or, with
//! `parent_concurrency > 1`, a bounded number of parents are fetched ahead
//! while emission stays in source order).
//!
//! For incremental streams the cursor is saved after every emitted page and
//! only ever moves forward. Fan-out streams also record the last fully
//! emitted parent and the bookmark the run started from, so an interrupted
//! run resumes without skipping changes under parents it never reached.

use crate::config::TimeEntryConfig;
use crate::cursor::CursorStore;
use crate::descriptor::{EndpointRequest, Registry, StreamDescriptor, StreamKind};
use crate::error::TapError;
use crate::fetcher::Fetcher;
use crate::fields::{CustomFieldMerger, scopes_for_task};
use crate::sink::OutputSink;
use crate::types::{Cursor, Record, compare_replication_values, value_to_id};
use crate::window::TimeWindowSelector;
use chrono::Utc;
use eyre::{Result, WrapErr};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Ancestor ids visible to a request, outermost first.
type Scope = Vec<(String, String)>;

/// Counters for one stream run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub records: u64,
    pub pages: u64,
    pub parents: u64,
}

/// Mutable state of the stream being extracted.
struct Progress {
    cursor: Cursor,
    /// Records older than this are dropped; also sent to the source when supported.
    floor: Option<Value>,
    /// Keys already emitted at exactly the floor value.
    seen_at_floor: Vec<String>,
    /// Parent to skip through before emitting again (resume of a fan-out run).
    skip_through: Option<String>,
    stats: StreamStats,
}

impl Progress {
    fn start(target: &StreamDescriptor, mut cursor: Cursor, fan_out: bool) -> Self {
        if !target.is_incremental() {
            return Self {
                cursor: Cursor::empty(&target.name),
                floor: None,
                seen_at_floor: Vec::new(),
                skip_through: None,
                stats: StreamStats::default(),
            };
        }

        // a resumed fan-out run may re-emit boundary records; at-least-once holds
        let (floor, seen_at_floor, skip_through) = if fan_out && cursor.is_in_progress() {
            (cursor.run_floor.clone(), Vec::new(), cursor.parent_context.clone())
        } else {
            cursor.parent_context = None;
            cursor.run_floor = if fan_out { cursor.bookmark.clone() } else { None };
            (cursor.bookmark.clone(), cursor.boundary_keys.clone(), None)
        };

        Self {
            cursor,
            floor,
            seen_at_floor,
            skip_through,
            stats: StreamStats::default(),
        }
    }

    /// Whether a record must be dropped as already replicated.
    fn is_stale(&self, value: &Value, key: &str) -> bool {
        match &self.floor {
            Some(floor) => match compare_replication_values(value, floor) {
                CmpOrdering::Less => true,
                CmpOrdering::Equal => self.seen_at_floor.iter().any(|k| k == key),
                CmpOrdering::Greater => false,
            },
            None => false,
        }
    }

    /// Cursor view used to pick time windows: the floor acts as the bookmark.
    fn floor_cursor(&self) -> Cursor {
        Cursor {
            bookmark: self.floor.clone(),
            ..Cursor::empty(&self.cursor.stream)
        }
    }
}

/// Extracts streams against the shared fetcher, cursor store and sink.
#[derive(Clone)]
pub struct HierarchyWalker {
    registry: Arc<Registry>,
    fetcher: Arc<Fetcher>,
    cursors: Arc<dyn CursorStore>,
    sink: Arc<dyn OutputSink>,
    merger: Arc<CustomFieldMerger>,
    windows: Arc<TimeWindowSelector>,
    stop: Arc<AtomicBool>,
    parent_concurrency: usize,
}

impl HierarchyWalker {
    pub fn new(
        registry: Arc<Registry>,
        fetcher: Arc<Fetcher>,
        cursors: Arc<dyn CursorStore>,
        sink: Arc<dyn OutputSink>,
        time_entries: TimeEntryConfig,
    ) -> Self {
        Self {
            merger: Arc::new(CustomFieldMerger::new(Arc::clone(&fetcher))),
            windows: Arc::new(TimeWindowSelector::new(time_entries, Arc::clone(&fetcher))),
            registry,
            fetcher,
            cursors,
            sink,
            stop: Arc::new(AtomicBool::new(false)),
            parent_concurrency: 1,
        }
    }

    /// Fetch up to `n` parents' children ahead of emission.
    pub fn with_parent_concurrency(mut self, n: usize) -> Self {
        self.parent_concurrency = n.max(1);
        self
    }

    /// Share an external stop flag, checked between pages.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn merger(&self) -> &CustomFieldMerger {
        &self.merger
    }

    /// Extract one stream to completion.
    pub async fn walk(&self, name: &str) -> Result<StreamStats> {
        let lineage = self.registry.lineage(name)?;
        let target = *lineage
            .last()
            .ok_or_else(|| eyre::eyre!(TapError::Configuration(format!("empty lineage for '{}'", name))))?;
        let fan_out = lineage.len() > 1;

        let cursor = if target.is_incremental() {
            self.cursors
                .load(name)
                .wrap_err_with(|| format!("Failed to load cursor for {}", name))?
        } else {
            Cursor::empty(name)
        };
        let mut progress = Progress::start(target, cursor, fan_out);

        log::info!(
            "Starting {} ({} levels, floor {:?}, resume after {:?})",
            name,
            lineage.len(),
            progress.floor,
            progress.skip_through
        );

        if fan_out {
            loop {
                self.visit(&lineage, 0, Vec::new(), &mut progress).await?;
                match progress.skip_through.take() {
                    // the saved parent vanished, so nothing was emitted yet; start over
                    Some(missing) => log::warn!(
                        "{}: resume parent {} no longer returned, re-walking all parents",
                        name,
                        missing
                    ),
                    None => break,
                }
            }
        } else {
            self.drain(target, &Vec::new(), &mut progress).await?;
        }

        if target.is_incremental() {
            progress.cursor.parent_context = None;
            progress.cursor.run_floor = None;
            self.save(&progress.cursor)?;
        }

        log::info!(
            "Finished {}: {} records in {} pages",
            name,
            progress.stats.records,
            progress.stats.pages
        );
        Ok(progress.stats)
    }

    /// Page through `lineage[depth]` and descend into each record.
    fn visit<'a>(
        &'a self,
        lineage: &'a [&'a StreamDescriptor],
        depth: usize,
        scope: Scope,
        progress: &'a mut Progress,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stream = lineage[depth];
            let child = lineage[depth + 1];
            let request = stream.endpoint.resolve(&scope)?;

            let mut token = None;
            loop {
                self.check_stop()?;
                let page = self
                    .fetcher
                    .fetch_page(&request, token.as_ref())
                    .await
                    .wrap_err_with(|| format!("Failed to fetch {} page", stream.name))?;

                let mut parents = Vec::with_capacity(page.records.len());
                for record in page.records {
                    match parent_scope(stream, child, &scope, &record) {
                        Some((id, child_scope)) => parents.push((id, child_scope)),
                        None => log::warn!("{} record without id, skipping its children", stream.name),
                    }
                }

                if depth + 2 == lineage.len() {
                    self.fan_out(child, parents, progress).await?;
                } else {
                    for (_, child_scope) in parents {
                        self.visit(lineage, depth + 1, child_scope, progress).await?;
                    }
                }

                match page.next_token {
                    Some(next) => token = Some(next),
                    None => return Ok(()),
                }
            }
        })
    }

    /// Extract `target` under each parent, in parent order.
    async fn fan_out(&self, target: &StreamDescriptor, parents: Vec<(String, Scope)>, progress: &mut Progress) -> Result<()> {
        let mut jobs = Vec::with_capacity(parents.len());
        for (id, scope) in parents {
            if let Some(skip) = &progress.skip_through {
                if *skip == id {
                    log::info!("{}: resuming after parent {}", target.name, id);
                    progress.skip_through = None;
                }
                continue;
            }
            jobs.push((id, scope));
        }

        if self.parent_concurrency <= 1 {
            for (id, scope) in jobs {
                self.drain(target, &scope, progress).await?;
                self.finish_parent(target, id, progress)?;
            }
            return Ok(());
        }

        let floor_cursor = progress.floor_cursor();
        let mut ahead = stream::iter(jobs.into_iter().map(|(id, scope)| {
            let floor_cursor = floor_cursor.clone();
            async move {
                let pages = self.collect_pages(target, &scope, &floor_cursor).await;
                (id, scope, pages)
            }
        }))
        .buffered(self.parent_concurrency);

        while let Some((id, scope, pages)) = ahead.next().await {
            for records in pages? {
                self.emit_page(target, records, &scope, progress).await?;
            }
            self.finish_parent(target, id, progress)?;
        }
        Ok(())
    }

    /// Fetch and emit every page of `target` under `scope`.
    async fn drain(&self, target: &StreamDescriptor, scope: &Scope, progress: &mut Progress) -> Result<()> {
        let request = self.request_for(target, scope, &progress.floor_cursor()).await?;
        let mut token = None;
        loop {
            self.check_stop()?;
            let page = self
                .fetcher
                .fetch_page(&request, token.as_ref())
                .await
                .wrap_err_with(|| format!("Failed to fetch {} page", target.name))?;
            self.emit_page(target, page.records, scope, progress).await?;
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Fetch every page of `target` under `scope` without emitting.
    async fn collect_pages(&self, target: &StreamDescriptor, scope: &Scope, floor_cursor: &Cursor) -> Result<Vec<Vec<Record>>> {
        let request = self.request_for(target, scope, floor_cursor).await?;
        let mut pages = Vec::new();
        let mut token = None;
        loop {
            self.check_stop()?;
            let page = self
                .fetcher
                .fetch_page(&request, token.as_ref())
                .await
                .wrap_err_with(|| format!("Failed to fetch {} page", target.name))?;
            pages.push(page.records);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(pages),
            }
        }
    }

    /// Concrete request for `target`, including incremental or window parameters.
    async fn request_for(&self, target: &StreamDescriptor, scope: &Scope, floor_cursor: &Cursor) -> Result<EndpointRequest> {
        let request = target.endpoint.resolve(scope)?;

        match target.kind {
            StreamKind::TimeEntries => {
                let team_id = scope
                    .iter()
                    .rev()
                    .find(|(k, _)| k == "team_id")
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        eyre::eyre!(TapError::Configuration(format!(
                            "stream '{}' needs a team_id ancestor",
                            target.name
                        )))
                    })?;
                let window = self.windows.compute_window(floor_cursor, &team_id, Utc::now()).await?;
                Ok(request.with_params(window.to_params()))
            }
            _ => match (&target.endpoint.since, &floor_cursor.bookmark) {
                (Some(since), Some(bookmark)) if target.is_incremental() => match since.value_for(bookmark) {
                    Some(value) => Ok(request.with_params([(since.param.clone(), value)])),
                    None => {
                        log::debug!("{}: bookmark {} cannot be sent as {}", target.name, bookmark, since.param);
                        Ok(request)
                    }
                },
                _ => Ok(request),
            },
        }
    }

    /// Hand one page to the sink, then advance and persist the cursor.
    async fn emit_page(&self, target: &StreamDescriptor, records: Vec<Record>, scope: &Scope, progress: &mut Progress) -> Result<()> {
        let parent = target
            .parent_key
            .as_ref()
            .and_then(|key| scope.iter().rev().find(|(k, _)| k == key));
        let mut advanced = false;
        let mut emitted = 0;

        for mut record in records {
            if let Some((key, id)) = parent {
                record.entry(key.clone()).or_insert_with(|| Value::String(id.clone()));
            }
            let Some(record_key) = primary_key_of(target, &record) else {
                log::warn!("{}: record without a complete primary key, dropped", target.name);
                continue;
            };

            let replication_value = target
                .replication_key
                .as_ref()
                .and_then(|key| record.get(key))
                .filter(|v| !v.is_null())
                .cloned();

            if let Some(value) = &replication_value
                && progress.is_stale(value, &record_key)
            {
                continue;
            }

            if target.kind == StreamKind::Tasks {
                let scopes = scopes_for_task(&record);
                record = self
                    .merger
                    .merge_fields(record, &scopes)
                    .await
                    .wrap_err_with(|| format!("Failed to merge custom fields for {}", target.name))?;
            }

            self.sink.write_record(&target.name, &record)?;
            emitted += 1;

            if target.is_incremental()
                && let Some(value) = &replication_value
            {
                advanced |= progress.cursor.observe(value, &record_key);
            }
        }

        self.sink.flush()?;
        progress.stats.records += emitted;
        progress.stats.pages += 1;

        if advanced {
            self.save(&progress.cursor)?;
        }
        Ok(())
    }

    /// Record that every child of `parent_id` has been emitted.
    fn finish_parent(&self, target: &StreamDescriptor, parent_id: String, progress: &mut Progress) -> Result<()> {
        progress.stats.parents += 1;
        if target.is_incremental() {
            progress.cursor.parent_context = Some(parent_id);
            self.save(&progress.cursor)?;
        }
        Ok(())
    }

    /// Persist, then announce, the cursor.
    fn save(&self, cursor: &Cursor) -> Result<()> {
        self.cursors
            .save(cursor)
            .wrap_err_with(|| format!("Failed to save cursor for {}", cursor.stream))?;
        self.sink.write_state(cursor)
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(eyre::eyre!(TapError::Cancelled));
        }
        Ok(())
    }
}

/// Primary-key values of `record` joined into one identity string.
fn primary_key_of(stream: &StreamDescriptor, record: &Record) -> Option<String> {
    let parts: Option<Vec<String>> = stream
        .primary_key
        .iter()
        .map(|key| record.get(key).and_then(value_to_id))
        .collect();
    parts.map(|p| p.join("|"))
}

/// The id of `record` and the scope its `child` stream runs under.
fn parent_scope(
    stream: &StreamDescriptor,
    child: &StreamDescriptor,
    scope: &Scope,
    record: &Record,
) -> Option<(String, Scope)> {
    let id = stream
        .primary_key
        .first()
        .and_then(|key| record.get(key))
        .and_then(value_to_id)?;
    let key = child.parent_key.clone()?;
    let mut child_scope = scope.clone();
    child_scope.push((key, id.clone()));
    Some((id, child_scope))
}
