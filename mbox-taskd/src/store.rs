//! Database access and the application metadata store.
//!
//! The supervisor reads application installation/run state to decide what
//! must run after a restart and forces `Error` when an app task crashes.
//! All other state transitions belong to the app workers themselves.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::warn;

use crate::error::{Error, Result};

pub const DB_FILE: &str = "mbox.db";

/// Open the shared database in `data_dir`.
///
/// WAL mode lets worker processes write progress while the daemon reads.
pub async fn connect(data_dir: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(data_dir.join(DB_FILE))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationState {
    PendingInstall,
    PendingClone,
    PendingConfigure,
    PendingUninstall,
    PendingRestore,
    PendingUpdate,
    PendingForceUpdate,
    PendingBackup,
    Error,
    Installed,
}

impl InstallationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationState::PendingInstall => "pending_install",
            InstallationState::PendingClone => "pending_clone",
            InstallationState::PendingConfigure => "pending_configure",
            InstallationState::PendingUninstall => "pending_uninstall",
            InstallationState::PendingRestore => "pending_restore",
            InstallationState::PendingUpdate => "pending_update",
            InstallationState::PendingForceUpdate => "pending_force_update",
            InstallationState::PendingBackup => "pending_backup",
            InstallationState::Error => "error",
            InstallationState::Installed => "installed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let state = match s {
            "pending_install" => InstallationState::PendingInstall,
            "pending_clone" => InstallationState::PendingClone,
            "pending_configure" => InstallationState::PendingConfigure,
            "pending_uninstall" => InstallationState::PendingUninstall,
            "pending_restore" => InstallationState::PendingRestore,
            "pending_update" => InstallationState::PendingUpdate,
            "pending_force_update" => InstallationState::PendingForceUpdate,
            "pending_backup" => InstallationState::PendingBackup,
            "error" => InstallationState::Error,
            "installed" => InstallationState::Installed,
            _ => return None,
        };
        Some(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    PendingStart,
    PendingStop,
    Stopped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::PendingStart => "pending_start",
            RunState::PendingStop => "pending_stop",
            RunState::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let state = match s {
            "running" => RunState::Running,
            "pending_start" => RunState::PendingStart,
            "pending_stop" => RunState::PendingStop,
            "stopped" => RunState::Stopped,
            _ => return None,
        };
        Some(state)
    }
}

#[derive(Debug, Clone)]
pub struct AppEntry {
    pub id: String,
    pub installation_state: InstallationState,
    pub installation_progress: String,
    pub run_state: RunState,
    pub updated_at: DateTime<Utc>,
}

impl AppEntry {
    /// Whether a worker has to run for this app after a restart.
    ///
    /// Installed-and-running apps and apps in `Error` are left alone; every
    /// other combination has a queued transition (including run-state changes
    /// of installed apps).
    pub fn needs_task(&self) -> bool {
        match self.installation_state {
            InstallationState::Installed => self.run_state != RunState::Running,
            InstallationState::Error => false,
            _ => true,
        }
    }
}

/// Application metadata, owned by the app lifecycle module.
#[async_trait]
pub trait AppStore: Send + Sync {
    /// All readable apps in id order. Rows that cannot be parsed are skipped.
    async fn list(&self) -> Result<Vec<AppEntry>>;

    async fn get(&self, id: &str) -> Result<Option<AppEntry>>;

    /// Fails with `NotFound` for unknown apps.
    async fn set_installation_state(
        &self,
        id: &str,
        state: InstallationState,
        message: &str,
    ) -> Result<()>;
}

/// sqlite-backed application store.
pub struct SqliteAppStore {
    pool: SqlitePool,
}

impl SqliteAppStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS apps (
                id TEXT PRIMARY KEY,
                installation_state TEXT NOT NULL,
                installation_progress TEXT NOT NULL DEFAULT '',
                run_state TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace an app row.
    pub async fn upsert(
        &self,
        id: &str,
        installation_state: InstallationState,
        run_state: RunState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO apps (id, installation_state, installation_progress, run_state, updated_at)
            VALUES (?, ?, '', ?, ?)
            "#,
        )
        .bind(id)
        .bind(installation_state.as_str())
        .bind(run_state.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_run_state(&self, id: &str, run_state: RunState) -> Result<()> {
        let result = sqlx::query("UPDATE apps SET run_state = ?, updated_at = ? WHERE id = ?")
            .bind(run_state.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("app {}", id)));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM apps WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AppStore for SqliteAppStore {
    async fn list(&self) -> Result<Vec<AppEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, installation_state, installation_progress, run_state, updated_at
            FROM apps ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // One bad row must not hide the others from reconciliation
        let entries = rows
            .into_iter()
            .filter_map(|row| match row_to_entry(row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable app row");
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    async fn get(&self, id: &str) -> Result<Option<AppEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, installation_state, installation_progress, run_state, updated_at
            FROM apps WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_entry).transpose()
    }

    async fn set_installation_state(
        &self,
        id: &str,
        state: InstallationState,
        message: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE apps SET installation_state = ?, installation_progress = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(message)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("app {}", id)));
        }
        Ok(())
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<AppEntry> {
    let id: String = row.get("id");
    let istate: String = row.get("installation_state");
    let rstate: String = row.get("run_state");
    let updated_ms: i64 = row.get("updated_at");

    let installation_state = InstallationState::parse(&istate)
        .ok_or_else(|| Error::Internal(format!("app {} has unknown installation state {}", id, istate)))?;
    let run_state = RunState::parse(&rstate)
        .ok_or_else(|| Error::Internal(format!("app {} has unknown run state {}", id, rstate)))?;

    Ok(AppEntry {
        installation_state,
        installation_progress: row.get("installation_progress"),
        run_state,
        updated_at: DateTime::<Utc>::from_timestamp_millis(updated_ms).unwrap_or_default(),
        id,
    })
}
