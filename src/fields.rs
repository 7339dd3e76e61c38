//! Custom-field definitions merged onto task records from their ancestor scopes.

use crate::descriptor::{EndpointRequest, Pagination, RecordsAt};
use crate::fetcher::Fetcher;
use crate::types::{Record, value_to_id};
use eyre::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Field under which merged definitions are attached to a task.
pub const DEFINITIONS_FIELD: &str = "custom_field_definitions";

/// Hierarchy level a custom field can be declared at, most general first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKind {
    Space,
    Folder,
    List,
}

impl ScopeKind {
    fn segment(self) -> &'static str {
        match self {
            ScopeKind::Space => "space",
            ScopeKind::Folder => "folder",
            ScopeKind::List => "list",
        }
    }
}

/// One ancestor scope of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeRef {
    pub kind: ScopeKind,
    pub id: String,
}

impl ScopeRef {
    pub fn new(kind: ScopeKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    fn request(&self) -> EndpointRequest {
        EndpointRequest {
            path: format!("/{}/{}/field", self.kind.segment(), self.id),
            params: Vec::new(),
            records_at: RecordsAt::Array("fields".to_string()),
            pagination: Pagination::None,
        }
    }
}

/// Definitions declared at one scope, keyed by field id.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomFieldSet {
    pub scope: ScopeRef,
    pub fields: Map<String, Value>,
}

impl CustomFieldSet {
    pub fn from_records(scope: ScopeRef, records: Vec<Record>) -> Self {
        let mut fields = Map::new();
        for record in records {
            if let Some(id) = record.get("id").and_then(value_to_id) {
                fields.insert(id, Value::Object(record));
            }
        }
        Self { scope, fields }
    }
}

/// Overlay sets in order; later sets replace earlier definitions of the same id.
pub fn overlay<'a>(sets: impl IntoIterator<Item = &'a CustomFieldSet>) -> Map<String, Value> {
    let mut merged = Map::new();
    for set in sets {
        for (id, definition) in &set.fields {
            merged.insert(id.clone(), definition.clone());
        }
    }
    merged
}

/// The scopes a task record sits under, most general first. Hidden folders
/// (the container of folderless lists) carry no fields of their own.
pub fn scopes_for_task(task: &Record) -> Vec<ScopeRef> {
    let mut scopes = Vec::new();
    if let Some(id) = nested_id(task, "space") {
        scopes.push(ScopeRef::new(ScopeKind::Space, id));
    }
    let hidden = task
        .get("folder")
        .and_then(|f| f.get("hidden"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !hidden && let Some(id) = nested_id(task, "folder") {
        scopes.push(ScopeRef::new(ScopeKind::Folder, id));
    }
    if let Some(id) = nested_id(task, "list") {
        scopes.push(ScopeRef::new(ScopeKind::List, id));
    }
    scopes
}

fn nested_id(task: &Record, key: &str) -> Option<String> {
    task.get(key).and_then(|v| v.get("id")).and_then(value_to_id)
}

/// Fetches and caches per-scope definitions for the life of the run.
pub struct CustomFieldMerger {
    fetcher: Arc<Fetcher>,
    cache: Mutex<HashMap<ScopeRef, Arc<CustomFieldSet>>>,
}

impl CustomFieldMerger {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Definitions for one scope, fetched at most once per run unless two
    /// callers race on a cold entry.
    pub async fn definitions(&self, scope: &ScopeRef) -> Result<Arc<CustomFieldSet>> {
        if let Some(set) = self.cache.lock().await.get(scope) {
            return Ok(Arc::clone(set));
        }

        let records = self
            .fetcher
            .fetch_all(&scope.request())
            .await
            .with_context(|| format!("Failed to fetch custom fields for {:?} {}", scope.kind, scope.id))?;
        let set = Arc::new(CustomFieldSet::from_records(scope.clone(), records));
        log::debug!("Cached {} custom fields for {:?} {}", set.fields.len(), scope.kind, scope.id);

        self.cache.lock().await.insert(scope.clone(), Arc::clone(&set));
        Ok(set)
    }

    /// Attach the merged definitions from `scopes` (general to specific) to `task`.
    pub async fn merge_fields(&self, mut task: Record, scopes: &[ScopeRef]) -> Result<Record> {
        let mut sets = Vec::with_capacity(scopes.len());
        for scope in scopes {
            sets.push(self.definitions(scope).await?);
        }
        let merged = overlay(sets.iter().map(|s| s.as_ref()));
        task.insert(DEFINITIONS_FIELD.to_string(), Value::Object(merged));
        Ok(task)
    }

    /// Number of scopes currently cached.
    pub async fn cached_scopes(&self) -> usize {
        self.cache.lock().await.len()
    }
}
