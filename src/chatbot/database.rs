//! Persistent SQLite store of conversation turns.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use crate::chatbot::message::{SessionKey, Speaker, Turn};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new in-memory database.
    pub fn new() -> Result<Self, DatabaseError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let db = Self::init(Connection::open(path)?)?;
        info!("Loaded history from {:?} ({} turns)", path, db.count()?);
        Ok(db)
    }

    fn init(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                speaker TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(chat_id, user_id, id);
        "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::Poisoned)
    }

    pub fn count(&self) -> Result<usize, DatabaseError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn add_turn(&self, turn: &Turn) -> Result<(), DatabaseError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO turns (chat_id, user_id, speaker, text, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                turn.session.chat_id,
                turn.session.user_id,
                turn.speaker.as_str(),
                turn.text,
                turn.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Last `limit` turns of a session, oldest first.
    pub fn recent_turns(&self, session: SessionKey, limit: usize) -> Result<Vec<Turn>, DatabaseError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT speaker, text, timestamp FROM turns
             WHERE chat_id = ?1 AND user_id = ?2
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![session.chat_id, session.user_id, limit as i64], |row| {
            let speaker: String = row.get(0)?;
            let text: String = row.get(1)?;
            let timestamp: String = row.get(2)?;
            Ok((speaker, text, timestamp))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (speaker, text, timestamp) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default();
            turns.push(Turn {
                session,
                speaker: Speaker::parse(&speaker),
                text,
                timestamp,
            });
        }
        turns.reverse();
        Ok(turns)
    }

    /// Drop all but the newest `keep` turns of every session.
    pub fn prune(&self, keep: usize) -> Result<usize, DatabaseError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM turns WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY chat_id, user_id ORDER BY id DESC
                    ) AS rn FROM turns
                ) WHERE rn > ?1
            )",
            params![keep as i64],
        )?;
        Ok(removed)
    }
}
