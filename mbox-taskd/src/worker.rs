//! Worker-side helpers.
//!
//! A worker program is started as `<program> <id> [args...]` with
//! `MBOX_DATA_DIR` set, reports progress through the shared
//! [`ProgressStore`] and ends with the exit code convention in
//! [`crate::exit`].

use std::path::PathBuf;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::exit::{EXIT_HANDLED_FAILURE, EXIT_SUCCESS};
use crate::process::DATA_DIR_ENV;
use crate::progress::{ProgressStore, ProgressUpdate};

/// Exit code used when the outcome itself could not be recorded.
pub const EXIT_UNRECORDED: i32 = 1;

pub struct WorkerContext {
    pub id: String,
    pub args: Vec<String>,
    progress: ProgressStore,
}

impl WorkerContext {
    pub fn new(id: String, args: Vec<String>, progress: ProgressStore) -> Self {
        Self { id, args, progress }
    }

    /// Build the context from the process arguments and environment.
    pub async fn from_env() -> Result<Self> {
        let mut argv = std::env::args().skip(1);
        let id = argv
            .next()
            .ok_or_else(|| Error::Internal("missing task id argument".to_string()))?;

        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| Error::Internal(format!("{} is not set", DATA_DIR_ENV)))?;

        let progress = ProgressStore::open(&data_dir).await?;
        Ok(Self::new(id, argv.collect(), progress))
    }

    /// Exit with code 0 as soon as SIGTERM arrives.
    pub fn exit_on_sigterm(&self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let id = self.id.clone();
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!(id = %id, "Received SIGTERM, exiting");
                std::process::exit(EXIT_SUCCESS);
            }
        });
        Ok(())
    }

    pub async fn report(&self, percent: u8, message: &str) -> Result<()> {
        self.progress
            .update(&self.id, ProgressUpdate::progress(percent, message))
            .await?;
        Ok(())
    }

    /// Record the outcome and return the exit code to terminate with.
    pub async fn finish(&self, outcome: std::result::Result<Option<String>, String>) -> i32 {
        let (update, code) = match outcome {
            Ok(result) => (ProgressUpdate::succeeded(result), EXIT_SUCCESS),
            Err(message) => (ProgressUpdate::failed(message), EXIT_HANDLED_FAILURE),
        };

        match self.progress.update(&self.id, update).await {
            Ok(_) => code,
            Err(e) => {
                error!(id = %self.id, error = %e, "Failed to record task outcome");
                EXIT_UNRECORDED
            }
        }
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }
}
