//! Durable task progress records.
//!
//! One row per task id. The supervisor resets a row before it spawns a
//! worker, the worker updates it while running, and anyone may read it.
//! Rows are never deleted; the next run of the same id overwrites them.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use crate::error::{Error, Result};
use crate::store;

pub const STARTING_MESSAGE: &str = "Starting";

/// Stored state of one task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub args: Value,
    pub percent: u8,
    pub message: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// The error the worker recorded, if any. Empty strings count as none.
    pub fn error(&self) -> Option<&str> {
        self.error_message.as_deref().filter(|m| !m.is_empty())
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percent: Option<u8>,
    pub message: Option<String>,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

impl ProgressUpdate {
    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: Some(percent),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn succeeded(result: Option<String>) -> Self {
        Self {
            percent: Some(100),
            message: Some("Done".to_string()),
            result,
            ..Default::default()
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            percent: Some(100),
            error_message: Some(error_message.into()),
            ..Default::default()
        }
    }
}

/// Progress table in the shared database.
#[derive(Clone)]
pub struct ProgressStore {
    pool: SqlitePool,
}

impl ProgressStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open the database in `data_dir`, as worker processes do.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let pool = store::connect(data_dir).await?;
        Self::new(pool).await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                args_json TEXT NOT NULL DEFAULT '[]',
                percent INTEGER NOT NULL DEFAULT 0,
                message TEXT NOT NULL DEFAULT '',
                result TEXT,
                error_message TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Start a fresh run for `id`, discarding the previous one.
    pub async fn reset(&self, id: &str, args: &Value) -> Result<TaskRecord> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tasks (id, args_json, percent, message, result, error_message, updated_at)
            VALUES (?, ?, 0, ?, NULL, NULL, ?)
            "#,
        )
        .bind(id)
        .bind(serde_json::to_string(args)?)
        .bind(STARTING_MESSAGE)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.get(id).await
    }

    /// Merge `update` into the record. Percent is clamped to 100.
    pub async fn update(&self, id: &str, update: ProgressUpdate) -> Result<TaskRecord> {
        let percent = update.percent.map(|p| i64::from(p.min(100)));

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                percent = COALESCE(?, percent),
                message = COALESCE(?, message),
                result = COALESCE(?, result),
                error_message = COALESCE(?, error_message),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(percent)
        .bind(update.message)
        .bind(update.result)
        .bind(update.error_message)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("task {}", id)));
        }

        self.get(id).await
    }

    pub async fn get(&self, id: &str) -> Result<TaskRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, args_json, percent, message, result, error_message, updated_at
            FROM tasks WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_record(row),
            None => Err(Error::NotFound(format!("task {}", id))),
        }
    }

    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, args_json, percent, message, result, error_message, updated_at
            FROM tasks ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: SqliteRow) -> Result<TaskRecord> {
    let args_json: String = row.get("args_json");
    let percent: i64 = row.get("percent");
    let updated_ms: i64 = row.get("updated_at");

    Ok(TaskRecord {
        id: row.get("id"),
        args: serde_json::from_str(&args_json)?,
        percent: percent.clamp(0, 100) as u8,
        message: row.get("message"),
        result: row.get("result"),
        error_message: row.get("error_message"),
        updated_at: DateTime::<Utc>::from_timestamp_millis(updated_ms).unwrap_or_default(),
    })
}
