//! SQLite backend for the message store

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use thread_classifier::{Location, Message};
use tracing::info;

use super::{ChangeSet, Snapshot, StoreBackend};
use crate::error::{MvboxError, Result};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

pub struct SqliteBackend {
    pool: DbPool,
}

impl SqliteBackend {
    /// Open (or create) the database file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MvboxError::Database(format!("Failed to create db dir: {}", e))
                })?;
            }
        }

        info!("Opening message database at {:?}", path);
        // Connection-scoped settings, applied to every pooled connection
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")
        });
        let pool = Pool::builder().max_size(2).build(manager)?;

        let backend = Self { pool };
        backend.initialize_schema()?;
        Ok(backend)
    }

    fn connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| MvboxError::Database(format!("Failed to get connection: {}", e)))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,  -- normalized Message-ID
                parent_id TEXT,               -- normalized In-Reply-To
                is_protocol INTEGER NOT NULL,
                location TEXT NOT NULL,       -- source | target
                target_location TEXT NOT NULL,
                sequence_ref INTEGER NOT NULL, -- 0 once moved
                stuck INTEGER NOT NULL DEFAULT 0,
                retrieved_at INTEGER NOT NULL, -- unix millis
                size INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS folder_state (
                folder TEXT PRIMARY KEY,
                watermark INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;

        Ok(())
    }
}

/// Raw `messages` row before enum and timestamp decoding
struct MessageRow {
    id: String,
    parent_id: Option<String>,
    is_protocol_message: bool,
    location: String,
    target_location: String,
    sequence_ref: u32,
    stuck: bool,
    retrieved_at: i64,
    size: u32,
}

impl MessageRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            is_protocol_message: row.get(2)?,
            location: row.get(3)?,
            target_location: row.get(4)?,
            sequence_ref: row.get(5)?,
            stuck: row.get(6)?,
            retrieved_at: row.get(7)?,
            size: row.get(8)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let retrieved_at = DateTime::<Utc>::from_timestamp_millis(self.retrieved_at)
            .ok_or_else(|| {
                MvboxError::Database(format!(
                    "Bad timestamp for {}: {}",
                    self.id, self.retrieved_at
                ))
            })?;
        Ok(Message {
            location: parse_location(&self.location)?,
            target_location: parse_location(&self.target_location)?,
            id: self.id,
            parent_id: self.parent_id,
            is_protocol_message: self.is_protocol_message,
            sequence_ref: self.sequence_ref,
            stuck: self.stuck,
            retrieved_at,
            size: self.size,
        })
    }
}

fn parse_location(s: &str) -> Result<Location> {
    s.parse().map_err(|e| MvboxError::Database(format!("Bad row: {}", e)))
}

impl StoreBackend for SqliteBackend {
    fn load(&mut self) -> Result<Snapshot> {
        let conn = self.connection()?;

        let mut stmt = conn.prepare(
            "SELECT message_id, parent_id, is_protocol, location, target_location,
                    sequence_ref, stuck, retrieved_at, size
             FROM messages",
        )?;
        let rows = stmt.query_map([], MessageRow::from_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_message()?);
        }

        let mut stmt = conn.prepare("SELECT folder, watermark FROM folder_state")?;
        let watermarks: HashMap<String, u32> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        Ok(Snapshot {
            messages,
            watermarks,
        })
    }

    fn commit(&mut self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        {
            // Identity fields are written once; later flushes only touch the
            // mutable state columns
            let mut upsert_message = tx.prepare_cached(
                "INSERT INTO messages
                    (message_id, parent_id, is_protocol, location, target_location,
                     sequence_ref, stuck, retrieved_at, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(message_id) DO UPDATE SET
                    location = excluded.location,
                    target_location = excluded.target_location,
                    sequence_ref = excluded.sequence_ref,
                    stuck = excluded.stuck",
            )?;
            for msg in &changes.messages {
                upsert_message.execute(params![
                    msg.id,
                    msg.parent_id,
                    msg.is_protocol_message,
                    msg.location.as_str(),
                    msg.target_location.as_str(),
                    msg.sequence_ref,
                    msg.stuck,
                    msg.retrieved_at.timestamp_millis(),
                    msg.size,
                ])?;
            }

            let mut upsert_watermark = tx.prepare_cached(
                "INSERT INTO folder_state (folder, watermark) VALUES (?1, ?2)
                 ON CONFLICT(folder) DO UPDATE SET
                    watermark = MAX(watermark, excluded.watermark)",
            )?;
            for (folder, seq) in &changes.watermarks {
                upsert_watermark.execute(params![folder, seq])?;
            }
        }
        tx.commit()?;

        Ok(())
    }
}
