//! Stream descriptors and the validated registry that orders them.

use crate::error::TapError;
use crate::types::ReplicationMode;
use eyre::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Where the records live inside a raw response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordsAt {
    /// An array under this key.
    Array(String),
    /// A single object under this key.
    Object(String),
}

/// How the source pages through results for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// Everything arrives in one response.
    None,
    /// `page=0,1,2,...` until an empty or final page.
    PageNumber,
}

/// Static description of an endpoint. Paths may contain `{key}` placeholders
/// filled from ancestor record ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub path: String,
    pub records_at: RecordsAt,
    pub params: Vec<(String, String)>,
    pub pagination: Pagination,
    /// Query parameter that carries the bookmark to the source, if supported.
    pub since: Option<SinceFilter>,
}

/// How the bookmark is pushed down to the source as a lower bound.
#[derive(Debug, Clone, PartialEq)]
pub struct SinceFilter {
    pub param: String,
    /// The source compares strictly greater than (`_gt` style parameters).
    pub exclusive: bool,
}

impl SinceFilter {
    /// Parameter value that keeps records equal to `bookmark` in the response.
    ///
    /// Exclusive filters get `bookmark - 1` for integer bookmarks. Anything
    /// else cannot be widened, so no filter is sent and the local floor does
    /// all the work.
    pub fn value_for(&self, bookmark: &Value) -> Option<String> {
        if !self.exclusive {
            return Some(match bookmark {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        let n = match bookmark {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse::<i64>().ok()?,
            _ => return None,
        };
        Some(n.saturating_sub(1).to_string())
    }
}

impl Endpoint {
    pub fn new(path: impl Into<String>, records_at: RecordsAt) -> Self {
        Self {
            path: path.into(),
            records_at,
            params: Vec::new(),
            pagination: Pagination::None,
            since: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn paged(mut self) -> Self {
        self.pagination = Pagination::PageNumber;
        self
    }

    /// Send the bookmark as an inclusive lower bound.
    pub fn since(mut self, param: impl Into<String>) -> Self {
        self.since = Some(SinceFilter {
            param: param.into(),
            exclusive: false,
        });
        self
    }

    /// Send the bookmark through a strictly-greater-than parameter.
    pub fn since_after(mut self, param: impl Into<String>) -> Self {
        self.since = Some(SinceFilter {
            param: param.into(),
            exclusive: true,
        });
        self
    }

    /// Names of the `{placeholders}` in the path.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut rest = self.path.as_str();
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else { break };
            out.push(&rest[open + 1..open + close]);
            rest = &rest[open + close + 1..];
        }
        out
    }

    /// Fill placeholders from `scope` and produce a concrete request.
    pub fn resolve(&self, scope: &[(String, String)]) -> Result<EndpointRequest> {
        let mut path = self.path.clone();
        for name in self.placeholders() {
            let value = scope
                .iter()
                .rev()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| {
                    eyre::eyre!(TapError::Configuration(format!(
                        "no value for placeholder '{}' in {}",
                        name, self.path
                    )))
                })?;
            path = path.replace(&format!("{{{}}}", name), value);
        }
        Ok(EndpointRequest {
            path,
            params: self.params.clone(),
            records_at: self.records_at.clone(),
            pagination: self.pagination,
        })
    }
}

/// A concrete request against the entity source.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRequest {
    pub path: String,
    pub params: Vec<(String, String)>,
    pub records_at: RecordsAt,
    pub pagination: Pagination,
}

impl EndpointRequest {
    pub fn with_params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.params.extend(params);
        self
    }

    /// Value of a query parameter, last one wins.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Post-processing a stream needs beyond plain extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Standard,
    /// Records get custom-field definitions merged from their ancestor scopes.
    Tasks,
    /// Requests are bounded by a computed time window.
    TimeEntries,
}

/// Declaration of one entity type's extraction pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub name: String,
    pub parent: Option<String>,
    /// Name under which the parent's id is exposed to this stream's path and records.
    pub parent_key: Option<String>,
    pub primary_key: Vec<String>,
    pub replication_mode: ReplicationMode,
    pub replication_key: Option<String>,
    pub endpoint: Endpoint,
    pub kind: StreamKind,
}

impl StreamDescriptor {
    /// A full-table root stream keyed by `id`.
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            parent: None,
            parent_key: None,
            primary_key: vec!["id".to_string()],
            replication_mode: ReplicationMode::FullTable,
            replication_key: None,
            endpoint,
            kind: StreamKind::Standard,
        }
    }

    /// Make this a child of `parent`, exposing the parent id as `parent_key`.
    pub fn child_of(mut self, parent: impl Into<String>, parent_key: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self.parent_key = Some(parent_key.into());
        self
    }

    pub fn primary_key(mut self, fields: &[&str]) -> Self {
        self.primary_key = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn incremental(mut self, replication_key: impl Into<String>) -> Self {
        self.replication_mode = ReplicationMode::Incremental;
        self.replication_key = Some(replication_key.into());
        self
    }

    pub fn kind(mut self, kind: StreamKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_incremental(&self) -> bool {
        self.replication_mode == ReplicationMode::Incremental
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("stream name cannot be empty".to_string());
        }
        if self.primary_key.is_empty() {
            return Err(format!("stream '{}' has no primary key", self.name));
        }
        match (self.replication_mode, &self.replication_key) {
            (ReplicationMode::Incremental, None) => {
                return Err(format!("incremental stream '{}' has no replication key", self.name));
            }
            (ReplicationMode::FullTable, Some(key)) => {
                return Err(format!(
                    "full-table stream '{}' declares replication key '{}'",
                    self.name, key
                ));
            }
            _ => {}
        }
        if self.parent.is_some() != self.parent_key.is_some() {
            return Err(format!("stream '{}' must declare parent and parent key together", self.name));
        }
        Ok(())
    }
}

/// The ordered, validated set of streams known to the tap.
#[derive(Debug, Clone)]
pub struct Registry {
    streams: Vec<StreamDescriptor>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Validate and index descriptors. Every problem with the graph surfaces
    /// here, before any fetch happens.
    pub fn new(streams: Vec<StreamDescriptor>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, stream) in streams.iter().enumerate() {
            stream.validate().map_err(|msg| eyre::eyre!(TapError::Configuration(msg)))?;
            if index.insert(stream.name.clone(), i).is_some() {
                return Err(configuration(format!("stream '{}' registered twice", stream.name)));
            }
        }

        let registry = Self { streams, index };

        for stream in &registry.streams {
            if let Some(parent) = &stream.parent
                && !registry.index.contains_key(parent)
            {
                return Err(configuration(format!(
                    "stream '{}' declares unknown parent '{}'",
                    stream.name, parent
                )));
            }
        }

        for stream in &registry.streams {
            let lineage = registry.lineage(&stream.name)?;
            let available: Vec<&str> = lineage.iter().filter_map(|s| s.parent_key.as_deref()).collect();
            for name in stream.endpoint.placeholders() {
                if !available.contains(&name) {
                    return Err(configuration(format!(
                        "stream '{}' path uses '{{{}}}' but no ancestor provides it",
                        stream.name, name
                    )));
                }
            }
        }

        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&StreamDescriptor> {
        self.index.get(name).map(|&i| &self.streams[i])
    }

    /// Look up a stream, failing with a configuration error if it is unknown.
    pub fn require(&self, name: &str) -> Result<&StreamDescriptor> {
        self.get(name)
            .ok_or_else(|| configuration(format!("unknown stream '{}'", name)))
    }

    pub fn parent_of(&self, stream: &StreamDescriptor) -> Option<&StreamDescriptor> {
        stream.parent.as_deref().and_then(|p| self.get(p))
    }

    /// The chain of streams from the root down to `name`, inclusive.
    pub fn lineage(&self, name: &str) -> Result<Vec<&StreamDescriptor>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(self.require(name)?);

        while let Some(stream) = current {
            if !seen.insert(stream.name.as_str()) {
                return Err(configuration(format!(
                    "parent cycle detected through stream '{}'",
                    stream.name
                )));
            }
            chain.push(stream);
            current = match &stream.parent {
                Some(parent) => Some(self.require(parent)?),
                None => None,
            };
        }

        chain.reverse();
        Ok(chain)
    }

    /// All streams in registration order.
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn names(&self) -> Vec<&str> {
        self.streams.iter().map(|s| s.name.as_str()).collect()
    }

    /// Streams whose parent is `name`.
    pub fn children_of(&self, name: &str) -> Vec<&StreamDescriptor> {
        self.streams
            .iter()
            .filter(|s| s.parent.as_deref() == Some(name))
            .collect()
    }
}

fn configuration(msg: String) -> eyre::Report {
    eyre::eyre!(TapError::Configuration(msg))
}
