//! In-memory launcher for testing supervisors without spawning processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::exit::WorkerExit;
use crate::process::{Launcher, WorkerControl, WorkerHandle, WorkerSpec};

/// A recorded launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Launch {
    /// Worker id, the first positional argument.
    pub fn id(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }
}

struct FakeWorker {
    finish_tx: mpsc::UnboundedSender<WorkerExit>,
    live: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakeState {
    launches: Vec<Launch>,
    workers: HashMap<String, FakeWorker>,
}

/// Fake launcher keyed by worker id (first argument).
///
/// Workers stay alive until [`FakeLauncher::exit`] is called or they receive
/// SIGTERM. Like real workers they exit with code 0 on SIGTERM; see
/// [`FakeLauncher::on_sigterm`] to change that.
#[derive(Clone)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
    sigterm_exit: Arc<Mutex<Option<WorkerExit>>>,
    fail_launch: Arc<AtomicBool>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            sigterm_exit: Arc::new(Mutex::new(Some(WorkerExit::Code(0)))),
            fail_launch: Arc::default(),
        }
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// How workers launched from now on react to SIGTERM. `None` ignores it.
    pub fn on_sigterm(&self, exit: Option<WorkerExit>) {
        *self.sigterm_exit.lock().unwrap_or_else(|e| e.into_inner()) = exit;
    }

    /// Make subsequent launches fail with an IO error.
    pub fn fail_launches(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Finish the live worker `id`. Returns false if it is not running.
    pub fn exit(&self, id: &str, exit: WorkerExit) -> bool {
        let state = self.lock();
        match state.workers.get(id) {
            Some(worker) if worker.live.load(Ordering::SeqCst) => {
                worker.finish_tx.send(exit).is_ok()
            }
            _ => false,
        }
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.lock()
            .workers
            .get(id)
            .map(|w| w.live.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.lock()
            .workers
            .values()
            .filter(|w| w.live.load(Ordering::SeqCst))
            .count()
    }

    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .workers
            .iter()
            .filter(|(_, w)| w.live.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.lock().launches.clone()
    }

    /// Ids in launch order.
    pub fn launch_order(&self) -> Vec<String> {
        self.lock()
            .launches
            .iter()
            .map(|l| l.id().to_string())
            .collect()
    }

    pub fn launch_count(&self, id: &str) -> usize {
        self.lock().launches.iter().filter(|l| l.id() == id).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", spec.program.display()),
            )));
        }

        let launch = Launch {
            program: spec.program,
            args: spec.args,
        };
        let id = launch.id().to_string();

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<Signal>();
        let (finish_tx, mut finish_rx) = mpsc::unbounded_channel::<WorkerExit>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let live = Arc::new(AtomicBool::new(true));
        let sigterm_exit = *self.sigterm_exit.lock().unwrap_or_else(|e| e.into_inner());

        {
            let mut state = self.lock();
            state.launches.push(launch);
            state.workers.insert(
                id,
                FakeWorker {
                    finish_tx,
                    live: live.clone(),
                },
            );
        }

        tokio::spawn(async move {
            let exit = loop {
                tokio::select! {
                    Some(exit) = finish_rx.recv() => break exit,
                    Some(signal) = signal_rx.recv() => match (signal, sigterm_exit) {
                        (Signal::SIGTERM, Some(exit)) => break exit,
                        (Signal::SIGTERM, None) => continue,
                        (signal, _) => break WorkerExit::Signal(signal as i32),
                    },
                    else => break WorkerExit::Signal(Signal::SIGKILL as i32),
                }
            };
            live.store(false, Ordering::SeqCst);
            let _ = exit_tx.send(exit);
        });

        Ok(WorkerHandle {
            control: WorkerControl::new(None, signal_tx),
            exit: exit_rx,
        })
    }
}
