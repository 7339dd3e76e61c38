//! Cursor persistence: one row per stream in a SQLite database.

use crate::error::TapError;
use crate::types::Cursor;
use chrono::Utc;
use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// Default database file name inside the state directory.
pub const STATE_DB_FILE: &str = "state.db";

/// Load/save replication progress per stream.
///
/// `save` must be atomic: a reader sees either the previous cursor or the
/// new one, never a mix.
pub trait CursorStore: Send + Sync {
    /// The saved cursor, or an empty one if the stream has never run.
    fn load(&self, stream: &str) -> Result<Cursor>;

    fn save(&self, cursor: &Cursor) -> Result<()>;

    /// Every saved cursor, ordered by stream name.
    fn list(&self) -> Result<Vec<Cursor>>;

    /// Forget a stream's progress. Returns whether anything was removed.
    fn remove(&self, stream: &str) -> Result<bool>;
}

/// SQLite-backed cursor store.
pub struct SqliteCursorStore {
    db: Mutex<Connection>,
}

impl SqliteCursorStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).context("Failed to create state directory")?;
        }
        let db = Connection::open(path).map_err(persistence)?;
        Self::with_connection(db)
    }

    /// A throwaway store, for dry runs.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().map_err(persistence)?;
        Self::with_connection(db)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                stream TEXT PRIMARY KEY,
                bookmark TEXT,
                parent_context TEXT,
                run_floor TEXT,
                boundary_keys TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(persistence)
        .context("Failed to initialize cursor schema")?;

        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| eyre::eyre!(TapError::Persistence("cursor database lock poisoned".to_string())))
    }
}

impl CursorStore for SqliteCursorStore {
    fn load(&self, stream: &str) -> Result<Cursor> {
        let db = self.lock()?;
        let row = db
            .query_row(
                "SELECT bookmark, parent_context, run_floor, boundary_keys FROM cursors WHERE stream = ?",
                params![stream],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(persistence)?;

        match row {
            None => Ok(Cursor::empty(stream)),
            Some((bookmark, parent_context, run_floor, boundary_keys)) => Ok(Cursor {
                stream: stream.to_string(),
                bookmark: decode(bookmark)?,
                parent_context,
                run_floor: decode(run_floor)?,
                boundary_keys: match boundary_keys {
                    Some(text) => serde_json::from_str(&text).map_err(persistence)?,
                    None => Vec::new(),
                },
            }),
        }
    }

    fn save(&self, cursor: &Cursor) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            r#"
            INSERT OR REPLACE INTO cursors (stream, bookmark, parent_context, run_floor, boundary_keys, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                cursor.stream,
                encode(&cursor.bookmark)?,
                cursor.parent_context,
                encode(&cursor.run_floor)?,
                serde_json::to_string(&cursor.boundary_keys).map_err(persistence)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(persistence)?;
        log::debug!("Saved cursor {:?}", cursor);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Cursor>> {
        let names: Vec<String> = {
            let db = self.lock()?;
            let mut stmt = db
                .prepare("SELECT stream FROM cursors ORDER BY stream")
                .map_err(persistence)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(persistence)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(persistence)?;
            rows
        };
        names.iter().map(|name| self.load(name)).collect()
    }

    fn remove(&self, stream: &str) -> Result<bool> {
        let db = self.lock()?;
        let removed = db
            .execute("DELETE FROM cursors WHERE stream = ?", params![stream])
            .map_err(persistence)?;
        Ok(removed > 0)
    }
}

fn encode(value: &Option<Value>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(persistence))
        .transpose()
}

fn decode(text: Option<String>) -> Result<Option<Value>> {
    text.map(|t| serde_json::from_str(&t).map_err(persistence)).transpose()
}

fn persistence(e: impl std::fmt::Display) -> eyre::Report {
    eyre::eyre!(TapError::Persistence(e.to_string()))
}
