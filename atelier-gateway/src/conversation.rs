//! Conversation history backed by SQLite.
//!
//! Messages are partitioned by session id and returned in insertion order.

use crate::provider::{Role, Turn};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Row id, monotonically increasing
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Whether the user attached a file to this message
    pub has_image: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn to_turn(&self) -> Turn {
        Turn {
            role: self.role,
            text: self.content.clone(),
        }
    }
}

/// Message store backed by SQLite.
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    /// Open (or create) the store at `db_path`, creating parent directories.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        Self::init(conn)
    }

    /// Store that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                has_image INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
            ",
        )
        .context("Failed to initialize messages table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append a message to a session.
    pub fn append(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        has_image: bool,
    ) -> Result<StoredMessage> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        let now = Utc::now();

        conn.execute(
            r"
            INSERT INTO messages (session_id, role, content, has_image, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                session_id,
                role.as_str(),
                content,
                i64::from(has_image),
                now.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to append message to session '{session_id}'"))?;

        Ok(StoredMessage {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            has_image,
            created_at: now,
        })
    }

    /// All messages of a session, oldest first.
    pub fn list(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;

        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, has_image, created_at
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;

        let messages = stmt
            .query_map(params![session_id], |row| {
                let role: String = row.get(2)?;
                let created_at: String = row.get(5)?;

                Ok(StoredMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: Role::from_stored(&role),
                    content: row.get(3)?,
                    has_image: row.get::<_, i64>(4)? != 0,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to read history for session '{session_id}'"))?;

        Ok(messages)
    }

    /// Delete every message of a session. Returns the number of rows removed.
    pub fn clear(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        let rows = conn
            .execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])
            .with_context(|| format!("Failed to clear session '{session_id}'"))?;
        Ok(rows)
    }

    /// Number of messages in a session.
    pub fn count(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
