//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of app task workers that may run at once.
pub const DEFAULT_CONCURRENCY: usize = 3;

pub const APP_LOG_FILE: &str = "apptask.log";

/// Filesystem layout shared by both supervisors.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Holds the database; exported to workers.
    pub data_dir: PathBuf,
    /// Root of all worker log files.
    pub log_dir: PathBuf,
    /// Program started as `<program> <app_id>` for app tasks.
    pub apptask_program: PathBuf,
    /// Program started as `<program> <task_type> [args]` for platform tasks.
    pub task_program: PathBuf,
}

impl Paths {
    /// `<log_dir>/<app_id>/apptask.log`
    pub fn app_log_file(&self, app_id: &str) -> PathBuf {
        self.log_dir.join(app_id).join(APP_LOG_FILE)
    }

    /// `<log_dir>/tasks/<task_type>.log`
    pub fn task_log_file(&self, task_type: &str) -> PathBuf {
        self.log_dir.join("tasks").join(format!("{}.log", task_type))
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/mbox"),
            log_dir: PathBuf::from("/var/log/mbox"),
            apptask_program: PathBuf::from("/usr/lib/mbox/apptask"),
            task_program: PathBuf::from("/usr/lib/mbox/mbox-taskworker"),
        }
    }
}

/// AppTaskSupervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum number of live app workers.
    pub concurrency: usize,
    /// Start paused; the platform resumes once it is up.
    pub start_paused: bool,
    /// How often `drain_and_wait` checks for quiescence.
    pub drain_poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            start_paused: true,
            drain_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub paths: Paths,
    pub supervisor: SupervisorConfig,
}
