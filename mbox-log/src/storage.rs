//! Event log storage.
//!
//! The [`EventLog`] trait is the seam other components write through; the
//! sqlite implementation shares the daemon's database pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{AuditSource, EventEntry};

/// Errors from event log operations.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp in event {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, EventLogError>;

/// Append-only audit/event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event and return the stored entry.
    async fn add(&self, action: &str, source: &AuditSource, data: Value) -> Result<EventEntry>;

    /// Newest first, optionally filtered by action.
    async fn list(&self, action: Option<&str>, limit: usize) -> Result<Vec<EventEntry>>;
}

/// Event log persisted in the shared sqlite database.
pub struct SqliteEventLog {
    pool: SqlitePool,
}

impl SqliteEventLog {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let log = Self { pool };
        log.migrate().await?;
        Ok(log)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                action TEXT NOT NULL,
                source_json TEXT NOT NULL,
                data_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_action ON events(action)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn add(&self, action: &str, source: &AuditSource, data: Value) -> Result<EventEntry> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let source_json = serde_json::to_string(source)?;
        let data_json = serde_json::to_string(&data)?;

        sqlx::query(
            r#"
            INSERT INTO events (id, action, source_json, data_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(action)
        .bind(&source_json)
        .bind(&data_json)
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(EventEntry {
            id,
            action: action.to_string(),
            source: source.clone(),
            data,
            created_at,
        })
    }

    async fn list(&self, action: Option<&str>, limit: usize) -> Result<Vec<EventEntry>> {
        let rows = match action {
            Some(action) => {
                sqlx::query(
                    r#"
                    SELECT id, action, source_json, data_json, created_at
                    FROM events WHERE action = ? ORDER BY seq DESC LIMIT ?
                    "#,
                )
                .bind(action)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, action, source_json, data_json, created_at
                    FROM events ORDER BY seq DESC LIMIT ?
                    "#,
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_entry).collect()
    }
}

fn row_to_entry(row: SqliteRow) -> Result<EventEntry> {
    let id: String = row.get("id");
    let source_json: String = row.get("source_json");
    let data_json: String = row.get("data_json");
    let created_ms: i64 = row.get("created_at");

    let created_at = DateTime::<Utc>::from_timestamp_millis(created_ms)
        .ok_or_else(|| EventLogError::InvalidTimestamp(id.clone()))?;

    Ok(EventEntry {
        id,
        action: row.get("action"),
        source: serde_json::from_str(&source_json)?,
        data: serde_json::from_str(&data_json)?,
        created_at,
    })
}
