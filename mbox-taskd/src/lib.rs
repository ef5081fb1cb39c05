//! mbox-taskd - task supervision core of the mbox platform.
//!
//! Runs background operations as isolated worker processes and decides
//! when they may run.
//!
//! ## Architecture
//!
//! - **Operation locks**: named exclusive/shared locks deciding which
//!   operation classes may run concurrently
//! - **Progress store**: durable per-task progress, written by workers
//! - **Task runner**: singleton platform tasks (backup, update, certificate
//!   renewal)
//! - **App task supervisor**: one worker per app, bounded concurrency, FIFO
//!   queue, pause/resume with reconciliation from persisted app state

pub mod app_tasks;
pub mod audit;
pub mod config;
pub mod error;
pub mod exit;
pub mod lock;
pub mod logs;
pub mod process;
pub mod progress;
pub mod store;
pub mod task_runner;
pub mod test_util;
pub mod worker;

use std::sync::Arc;

use mbox_log::SqliteEventLog;
use tracing::info;

use crate::app_tasks::AppTaskSupervisor;
use crate::audit::TaskAuditLogger;
use crate::config::Config;
use crate::error::Result;
use crate::lock::LockRegistry;
use crate::process::Launcher;
use crate::progress::ProgressStore;
use crate::store::SqliteAppStore;
use crate::task_runner::{TaskRegistry, TaskRunner};

/// Handles to the running supervisors and their stores.
pub struct Services {
    pub locks: Arc<LockRegistry>,
    pub progress: ProgressStore,
    pub events: Arc<SqliteEventLog>,
    pub apps: Arc<SqliteAppStore>,
    pub tasks: Arc<TaskRunner>,
    pub app_tasks: AppTaskSupervisor,
}

/// Open the database and start both supervisors. App tasks start paused.
pub async fn initialize_services(
    config: Config,
    launcher: Arc<dyn Launcher>,
) -> Result<Services> {
    info!(data_dir = %config.paths.data_dir.display(), "Initializing task services");

    tokio::fs::create_dir_all(&config.paths.data_dir).await?;
    tokio::fs::create_dir_all(&config.paths.log_dir).await?;

    let pool = store::connect(&config.paths.data_dir).await?;
    let events = Arc::new(SqliteEventLog::new(pool.clone()).await?);
    let apps = Arc::new(SqliteAppStore::new(pool.clone()).await?);
    let progress = ProgressStore::new(pool).await?;

    let audit = TaskAuditLogger::new(events.clone());
    let locks = Arc::new(LockRegistry::new());

    let tasks = Arc::new(TaskRunner::new(
        TaskRegistry::standard(&config.paths, &audit),
        locks.clone(),
        progress.clone(),
        audit.clone(),
        launcher.clone(),
        config.paths.data_dir.clone(),
    ));
    info!("Task runner initialized");

    let app_tasks = AppTaskSupervisor::spawn(
        config.supervisor,
        config.paths,
        locks.clone(),
        apps.clone(),
        audit,
        launcher,
    );
    info!("App task supervisor initialized");

    Ok(Services {
        locks,
        progress,
        events,
        apps,
        tasks,
        app_tasks,
    })
}
