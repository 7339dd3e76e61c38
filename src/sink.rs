//! Output sinks for emitted records and cursor updates.

use crate::types::{Cursor, Record};
use eyre::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

/// One emitted message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Record { stream: String, record: Record },
    State { cursor: Cursor },
}

impl Message {
    pub fn stream(&self) -> &str {
        match self {
            Message::Record { stream, .. } => stream,
            Message::State { cursor } => &cursor.stream,
        }
    }
}

/// Receives records and cursor updates.
///
/// The engine writes every record of a page, calls `flush`, persists the
/// cursor, and only then calls `write_state`.
pub trait OutputSink: Send + Sync {
    fn write_record(&self, stream: &str, record: &Record) -> Result<()>;

    fn write_state(&self, cursor: &Cursor) -> Result<()>;

    /// Make previously written records durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes one JSON message per line.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    fn write_message(&self, message: &Message) -> Result<()> {
        let line = serde_json::to_string(message).context("Failed to serialize message")?;
        let mut out = self.out.lock().map_err(|_| eyre::eyre!("output lock poisoned"))?;
        writeln!(out, "{}", line).context("Failed to write message")?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.out.into_inner().map_err(|_| eyre::eyre!("output lock poisoned"))
    }
}

impl<W: Write + Send> OutputSink for JsonLinesSink<W> {
    fn write_record(&self, stream: &str, record: &Record) -> Result<()> {
        self.write_message(&Message::Record {
            stream: stream.to_string(),
            record: record.clone(),
        })
    }

    fn write_state(&self, cursor: &Cursor) -> Result<()> {
        self.write_message(&Message::State { cursor: cursor.clone() })?;
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let mut out = self.out.lock().map_err(|_| eyre::eyre!("output lock poisoned"))?;
        out.flush().context("Failed to flush output")
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<Message>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Records emitted for `stream`, in emission order.
    pub fn records(&self, stream: &str) -> Vec<Record> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::Record { stream: s, record } if s == stream => Some(record),
                _ => None,
            })
            .collect()
    }

    /// State updates emitted for `stream`, in emission order.
    pub fn states(&self, stream: &str) -> Vec<Cursor> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::State { cursor } if cursor.stream == stream => Some(cursor),
                _ => None,
            })
            .collect()
    }

    fn push(&self, message: Message) -> Result<()> {
        self.messages
            .lock()
            .map_err(|_| eyre::eyre!("sink lock poisoned"))?
            .push(message);
        Ok(())
    }
}

impl OutputSink for MemorySink {
    fn write_record(&self, stream: &str, record: &Record) -> Result<()> {
        self.push(Message::Record {
            stream: stream.to_string(),
            record: record.clone(),
        })
    }

    fn write_state(&self, cursor: &Cursor) -> Result<()> {
        self.push(Message::State { cursor: cursor.clone() })
    }
}
