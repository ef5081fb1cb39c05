//! Shared test utilities for mbox-taskd integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mbox_log::{EventEntry, EventLog, SqliteEventLog};
use mbox_taskd::app_tasks::AppTaskSupervisor;
use mbox_taskd::audit::TaskAuditLogger;
use mbox_taskd::config::{Paths, SupervisorConfig};
use mbox_taskd::lock::LockRegistry;
use mbox_taskd::process::Launcher;
use mbox_taskd::progress::ProgressStore;
use mbox_taskd::store::{self, InstallationState, RunState, SqliteAppStore};
use mbox_taskd::test_util::FakeLauncher;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Database, stores and directories in a temp dir.
pub struct TestEnv {
    pub paths: Paths,
    pub locks: Arc<LockRegistry>,
    pub apps: Arc<SqliteAppStore>,
    pub events: Arc<SqliteEventLog>,
    pub progress: ProgressStore,
    pub audit: TaskAuditLogger,
    pub launcher: FakeLauncher,
    pub pool: SqlitePool,
    _temp_dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let paths = Paths {
            data_dir: temp_dir.path().join("data"),
            log_dir: temp_dir.path().join("logs"),
            apptask_program: PathBuf::from("/usr/lib/mbox/apptask"),
            task_program: PathBuf::from("/usr/lib/mbox/taskworker"),
        };
        tokio::fs::create_dir_all(&paths.data_dir)
            .await
            .expect("Failed to create data dir");

        let pool = store::connect(&paths.data_dir)
            .await
            .expect("Failed to open database");
        let events = Arc::new(SqliteEventLog::new(pool.clone()).await.unwrap());
        let apps = Arc::new(SqliteAppStore::new(pool.clone()).await.unwrap());
        let progress = ProgressStore::new(pool.clone()).await.unwrap();

        Self {
            audit: TaskAuditLogger::new(events.clone()),
            locks: Arc::new(LockRegistry::new()),
            launcher: FakeLauncher::new(),
            paths,
            apps,
            events,
            progress,
            pool,
            _temp_dir: temp_dir,
        }
    }

    /// App task supervisor on the fake launcher, not paused.
    pub fn supervisor(&self, concurrency: usize) -> AppTaskSupervisor {
        self.supervisor_with(
            SupervisorConfig {
                concurrency,
                start_paused: false,
                drain_poll_interval: Duration::from_millis(10),
            },
            Arc::new(self.launcher.clone()),
        )
    }

    pub fn supervisor_with(
        &self,
        config: SupervisorConfig,
        launcher: Arc<dyn Launcher>,
    ) -> AppTaskSupervisor {
        AppTaskSupervisor::spawn(
            config,
            self.paths.clone(),
            self.locks.clone(),
            self.apps.clone(),
            self.audit.clone(),
            launcher,
        )
    }

    pub async fn add_app(&self, id: &str, installation: InstallationState, run: RunState) {
        self.apps
            .upsert(id, installation, run)
            .await
            .expect("Failed to insert app");
    }

    /// Insert an app row with arbitrary state strings, bypassing the typed store.
    pub async fn insert_raw_app(&self, id: &str, installation_state: &str, run_state: &str) {
        sqlx::query(
            "INSERT INTO apps (id, installation_state, installation_progress, run_state, updated_at) VALUES (?, ?, '', ?, 0)",
        )
        .bind(id)
        .bind(installation_state)
        .bind(run_state)
        .execute(&self.pool)
        .await
        .expect("Failed to insert raw app row");
    }

    pub async fn events(&self, action: &str) -> Vec<EventEntry> {
        self.events
            .list(Some(action), 100)
            .await
            .expect("Failed to list events")
    }
}
