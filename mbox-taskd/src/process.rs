//! Worker process abstraction.
//!
//! Supervisors never touch `tokio::process` directly. They hand a
//! [`WorkerSpec`] to a [`Launcher`] and get back a [`WorkerHandle`] made of a
//! cloneable [`WorkerControl`] for signals and a one-shot exit receiver. The
//! exit receiver fires exactly once per spawned worker.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::exit::WorkerExit;

/// Environment variable pointing workers at the shared data directory.
pub const DATA_DIR_ENV: &str = "MBOX_DATA_DIR";

/// Everything needed to start one worker.
#[derive(Debug)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Receives both stdout and stderr.
    pub log: File,
}

/// Signal delivery to a running worker.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl WorkerControl {
    pub fn new(pid: Option<u32>, signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self { pid, signals }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the worker to exit. Returns false if it is already gone.
    pub fn terminate(&self) -> bool {
        self.signal(Signal::SIGTERM)
    }

    pub fn signal(&self, signal: Signal) -> bool {
        self.signals.send(signal).is_ok()
    }
}

pub struct WorkerHandle {
    pub control: WorkerControl,
    pub exit: oneshot::Receiver<WorkerExit>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle>;
}

/// Create the parent directory of `path` and open it for appending.
pub async fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(file)
}

/// Launches workers as real child processes.
#[derive(Debug, Default, Clone)]
pub struct OsLauncher;

impl OsLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for OsLauncher {
    async fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        let stderr = spec.log.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(spec.log))
            .stderr(Stdio::from(stderr));

        info!(program = %spec.program.display(), args = ?spec.args, "Spawning worker");

        let mut child = cmd.spawn()?;
        let pid = child.id();
        // Held open for the worker's lifetime; EOF tells the worker its parent is gone
        let stdin = child.stdin.take();

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<Signal>();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let _stdin = stdin;
            let exit = loop {
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => break WorkerExit::from(status),
                        Err(e) => {
                            error!(pid = ?pid, error = %e, "Failed to wait for worker");
                            break WorkerExit::Code(-1);
                        }
                    },
                    Some(signal) = signal_rx.recv() => {
                        let Some(pid) = pid else { continue };
                        debug!(pid = pid, signal = %signal, "Signalling worker");
                        if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
                            warn!(pid = pid, signal = %signal, error = %e, "Failed to signal worker");
                        }
                    }
                }
            };

            info!(pid = ?pid, exit = %exit, "Worker exited");
            let _ = exit_tx.send(exit);
        });

        Ok(WorkerHandle {
            control: WorkerControl::new(pid, signal_tx),
            exit: exit_rx,
        })
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(
        Pid::from_raw(pid as i32),
        None, // Signal 0 = just check if process exists
    )
    .is_ok()
}
