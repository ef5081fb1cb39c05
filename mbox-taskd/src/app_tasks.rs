//! Per-application task workers.
//!
//! One worker process per app id, at most `concurrency` of them at a time.
//! Requests beyond that, or while paused, or while the platform lock is held
//! exclusively, wait in a FIFO queue.
//!
//! All scheduling state (live slots, the queue, the pause flag) is owned by a
//! single dispatcher task. [`AppTaskSupervisor`] is a cheap handle that sends
//! it commands. The dispatcher also reacts to worker exits and to lock
//! releases, promoting queued apps whenever a slot could have become free.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::audit::TaskAuditLogger;
use crate::config::{Paths, SupervisorConfig};
use crate::error::{Error, Result};
use crate::exit::{ExitClass, WorkerExit};
use crate::lock::{LockRegistry, PLATFORM_LOCK};
use crate::logs::{self, LogLine};
use crate::process::{
    DATA_DIR_ENV, Launcher, WorkerControl, WorkerHandle, WorkerSpec, open_log_file,
};
use crate::store::{AppStore, InstallationState};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Where an app currently stands with the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SlotState {
    Idle,
    Queued {
        /// 0 is next in line.
        position: usize,
    },
    Running {
        pid: Option<u32>,
        log_file: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub paused: bool,
    pub concurrency: usize,
    /// Sorted app ids with a live worker.
    pub running: Vec<String>,
    /// Queue order, head first.
    pub pending: Vec<String>,
}

impl SupervisorSnapshot {
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }
}

#[derive(Debug)]
enum Command {
    Start {
        app_id: String,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Answered once the worker's exit was handled, or right away if it
    /// was not running.
    Stop {
        app_id: String,
        responder: oneshot::Sender<()>,
    },
    /// Sets paused, drops the queue, returns live app ids.
    Pause {
        responder: oneshot::Sender<Vec<String>>,
    },
    Resume {
        responder: oneshot::Sender<()>,
    },
    /// Drops the queue, returns live app ids.
    ClearQueue {
        responder: oneshot::Sender<Vec<String>>,
    },
    Status {
        app_id: String,
        responder: oneshot::Sender<SlotState>,
    },
    Snapshot {
        responder: oneshot::Sender<SupervisorSnapshot>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum Event {
    Exited {
        app_id: String,
        generation: u64,
        exit: WorkerExit,
    },
}

struct Slot {
    generation: u64,
    control: WorkerControl,
    log_file: PathBuf,
}

/// Handle to the app task dispatcher.
#[derive(Clone)]
pub struct AppTaskSupervisor {
    command_tx: mpsc::Sender<Command>,
    apps: Arc<dyn AppStore>,
    paths: Paths,
    config: SupervisorConfig,
}

impl AppTaskSupervisor {
    /// Start the dispatcher task and return a handle to it.
    pub fn spawn(
        config: SupervisorConfig,
        paths: Paths,
        locks: Arc<LockRegistry>,
        apps: Arc<dyn AppStore>,
        audit: TaskAuditLogger,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            released_rx: locks.subscribe(),
            paused: config.start_paused,
            config: config.clone(),
            paths: paths.clone(),
            locks,
            apps: apps.clone(),
            audit,
            launcher,
            command_rx,
            event_tx,
            event_rx,
            live: HashMap::new(),
            pending: VecDeque::new(),
            generation: 0,
            stop_waiters: HashMap::new(),
        };
        tokio::spawn(dispatcher.run());

        Self {
            command_tx,
            apps,
            paths,
            config,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Start a worker for `app_id`, or queue it if that is not possible now.
    ///
    /// Fails with `AlreadyActive` if a worker is live, and synchronously with
    /// the IO error if the log file cannot be opened or the program spawned.
    pub async fn start(&self, app_id: &str) -> Result<()> {
        let app_id = app_id.to_string();
        self.request(|responder| Command::Start { app_id, responder })
            .await?
    }

    /// Stop the live worker and wait for its exit to be handled, or drop the
    /// app from the queue. Stopping an idle app is a no-op.
    pub async fn stop(&self, app_id: &str) -> Result<()> {
        let app_id = app_id.to_string();
        self.request(|responder| Command::Stop { app_id, responder })
            .await
    }

    pub async fn restart(&self, app_id: &str) -> Result<()> {
        self.stop(app_id).await?;
        self.start(app_id).await
    }

    /// Drop the queue and stop every live worker, one at a time. New starts
    /// are queued until [`resume`](Self::resume).
    pub async fn pause(&self) -> Result<()> {
        let live = self
            .request(|responder| Command::Pause { responder })
            .await?;

        info!(live = live.len(), "Pausing app tasks");
        for app_id in live {
            self.stop(&app_id).await?;
        }
        Ok(())
    }

    /// Unpause and reconcile: every app whose persisted state still has work
    /// to do gets its worker restarted.
    pub async fn resume(&self) -> Result<()> {
        self.request(|responder| Command::Resume { responder })
            .await?;

        let apps = self.apps.list().await?;
        let pending: Vec<_> = apps.into_iter().filter(|app| app.needs_task()).collect();
        info!(apps = pending.len(), "Resuming app tasks");

        for app in pending {
            debug!(
                app_id = %app.id,
                installation_state = app.installation_state.as_str(),
                run_state = app.run_state.as_str(),
                "Reconciling app"
            );
            if let Err(e) = self.restart(&app.id).await {
                match e {
                    Error::Shutdown => return Err(e),
                    e => error!(app_id = %app.id, error = %e, "Failed to restart app task"),
                }
            }
        }
        Ok(())
    }

    /// Drop the queue and stop every live worker without pausing.
    pub async fn stop_all(&self) -> Result<()> {
        let live = self
            .request(|responder| Command::ClearQueue { responder })
            .await?;

        for app_id in live {
            self.stop(&app_id).await?;
        }
        Ok(())
    }

    /// Poll until nothing is running or queued.
    pub async fn drain_and_wait(&self) -> Result<()> {
        loop {
            if self.snapshot().await?.is_idle() {
                return Ok(());
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }
    }

    pub async fn status(&self, app_id: &str) -> Result<SlotState> {
        let app_id = app_id.to_string();
        self.request(|responder| Command::Status { app_id, responder })
            .await
    }

    pub async fn snapshot(&self) -> Result<SupervisorSnapshot> {
        self.request(|responder| Command::Snapshot { responder })
            .await
    }

    /// Last `lines` lines of the app's task log.
    pub async fn logs(&self, app_id: &str, lines: usize) -> Result<Vec<LogLine>> {
        logs::tail(&self.paths.app_log_file(app_id), lines, app_id).await
    }

    /// Last `lines` lines, then new lines as they are written, until the
    /// receiver is dropped.
    pub fn follow_logs(&self, app_id: &str, lines: usize) -> mpsc::Receiver<LogLine> {
        logs::follow(
            self.paths.app_log_file(app_id),
            lines,
            app_id.to_string(),
            logs::FOLLOW_POLL_INTERVAL,
        )
    }

    /// Stop the dispatcher. Live workers are not signalled; call
    /// [`pause`](Self::pause) first to stop them.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|responder| Command::Shutdown { responder })
            .await
    }
}

struct Dispatcher {
    config: SupervisorConfig,
    paths: Paths,
    locks: Arc<LockRegistry>,
    apps: Arc<dyn AppStore>,
    audit: TaskAuditLogger,
    launcher: Arc<dyn Launcher>,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    released_rx: broadcast::Receiver<String>,
    live: HashMap<String, Slot>,
    pending: VecDeque<String>,
    paused: bool,
    generation: u64,
    stop_waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

impl Dispatcher {
    async fn run(mut self) {
        info!(
            concurrency = self.config.concurrency,
            paused = self.paused,
            "App task dispatcher running"
        );

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Shutdown { responder }) => {
                        let _ = responder.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event).await,
                released = self.released_rx.recv() => match released {
                    Ok(name) => {
                        debug!(lock = %name, "Lock released, checking queue");
                        self.promote().await;
                    }
                    Err(RecvError::Lagged(_)) => self.promote().await,
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!(live = self.live.len(), "App task dispatcher shutting down");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { app_id, responder } => {
                let result = self.start(app_id).await;
                let _ = responder.send(result);
            }
            Command::Stop { app_id, responder } => self.stop(app_id, responder),
            Command::Pause { responder } => {
                self.paused = true;
                let dropped = self.pending.len();
                self.pending.clear();
                info!(dropped = dropped, "App tasks paused");
                let _ = responder.send(self.live.keys().cloned().collect());
            }
            Command::Resume { responder } => {
                self.paused = false;
                info!("App tasks resumed");
                self.promote().await;
                let _ = responder.send(());
            }
            Command::ClearQueue { responder } => {
                self.pending.clear();
                let _ = responder.send(self.live.keys().cloned().collect());
            }
            Command::Status { app_id, responder } => {
                let _ = responder.send(self.status(&app_id));
            }
            Command::Snapshot { responder } => {
                let mut running: Vec<String> = self.live.keys().cloned().collect();
                running.sort();
                let _ = responder.send(SupervisorSnapshot {
                    paused: self.paused,
                    concurrency: self.config.concurrency,
                    running,
                    pending: self.pending.iter().cloned().collect(),
                });
            }
            // Handled in run()
            Command::Shutdown { responder } => {
                let _ = responder.send(());
            }
        }
    }

    fn has_capacity(&self) -> bool {
        !self.paused && self.live.len() < self.config.concurrency
    }

    async fn start(&mut self, app_id: String) -> Result<()> {
        if self.live.contains_key(&app_id) {
            return Err(Error::AlreadyActive(app_id));
        }

        // Only start directly when nobody is waiting ahead of us
        if self.pending.is_empty()
            && self.has_capacity()
            && self.locks.acquire_shared(PLATFORM_LOCK).is_ok()
        {
            return self.launch(&app_id).await;
        }

        if !self.pending.contains(&app_id) {
            debug!(app_id = %app_id, position = self.pending.len(), "Queueing app task");
            self.pending.push_back(app_id);
        }
        self.promote().await;
        Ok(())
    }

    fn stop(&mut self, app_id: String, responder: oneshot::Sender<()>) {
        if let Some(slot) = self.live.get(&app_id) {
            info!(app_id = %app_id, pid = ?slot.control.pid(), "Stopping app task");
            if !slot.control.terminate() {
                debug!(app_id = %app_id, "Worker already gone, waiting for exit event");
            }
            self.stop_waiters.entry(app_id).or_default().push(responder);
            return;
        }

        if let Some(pos) = self.pending.iter().position(|id| *id == app_id) {
            self.pending.remove(pos);
            info!(app_id = %app_id, "Removed app task from queue");
        }
        let _ = responder.send(());
    }

    fn status(&self, app_id: &str) -> SlotState {
        if let Some(slot) = self.live.get(app_id) {
            return SlotState::Running {
                pid: slot.control.pid(),
                log_file: slot.log_file.clone(),
            };
        }

        match self.pending.iter().position(|id| id == app_id) {
            Some(position) => SlotState::Queued { position },
            None => SlotState::Idle,
        }
    }

    /// Start queue heads for as long as a slot and the shared lock are free.
    async fn promote(&mut self) {
        while self.has_capacity() {
            let Some(app_id) = self.pending.front().cloned() else {
                break;
            };
            if self.locks.acquire_shared(PLATFORM_LOCK).is_err() {
                break;
            }
            self.pending.pop_front();

            if let Err(e) = self.launch(&app_id).await {
                self.launch_failed(&app_id, &e).await;
            }
        }
    }

    /// A queued app could not be started and nobody is waiting for the
    /// result. Record it like a crash so the app does not sit in a pending
    /// state without a worker. Requeueing would retry on every lock release.
    async fn launch_failed(&self, app_id: &str, err: &Error) {
        let log_file = self.paths.app_log_file(app_id);
        let message = format!("App task failed to start: {}", err);
        error!(app_id = %app_id, error = %err, "Failed to start queued app task");

        if let Err(e) = self
            .apps
            .set_installation_state(app_id, InstallationState::Error, &message)
            .await
        {
            error!(app_id = %app_id, error = %e, "Failed to set app state after failed start");
        }
        self.audit.app_task_crashed(app_id, &log_file).await;
    }

    /// Spawn the worker. The shared lock must already be held and is
    /// released again on failure.
    async fn launch(&mut self, app_id: &str) -> Result<()> {
        let log_file = self.paths.app_log_file(app_id);

        let handle = match self.spawn_worker(app_id, &log_file).await {
            Ok(handle) => handle,
            Err(e) => {
                self.locks.release(PLATFORM_LOCK);
                return Err(e);
            }
        };

        self.generation += 1;
        let generation = self.generation;

        info!(app_id = %app_id, pid = ?handle.control.pid(), live = self.live.len() + 1, "App task started");
        self.live.insert(
            app_id.to_string(),
            Slot {
                generation,
                control: handle.control,
                log_file,
            },
        );

        let event_tx = self.event_tx.clone();
        let app_id = app_id.to_string();
        let exit_rx = handle.exit;
        tokio::spawn(async move {
            let exit = match exit_rx.await {
                Ok(exit) => exit,
                Err(_) => {
                    error!(app_id = %app_id, "Worker exit channel closed without a status");
                    WorkerExit::Code(-1)
                }
            };
            let _ = event_tx.send(Event::Exited {
                app_id,
                generation,
                exit,
            });
        });

        Ok(())
    }

    async fn spawn_worker(&self, app_id: &str, log_file: &Path) -> Result<WorkerHandle> {
        let log = open_log_file(log_file).await?;
        self.launcher
            .launch(WorkerSpec {
                program: self.paths.apptask_program.clone(),
                args: vec![app_id.to_string()],
                env: vec![(
                    DATA_DIR_ENV.to_string(),
                    self.paths.data_dir.display().to_string(),
                )],
                log,
            })
            .await
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Exited {
                app_id,
                generation,
                exit,
            } => self.handle_exit(app_id, generation, exit).await,
        }
    }

    async fn handle_exit(&mut self, app_id: String, generation: u64, exit: WorkerExit) {
        if self.live.get(&app_id).map(|s| s.generation) != Some(generation) {
            warn!(app_id = %app_id, generation = generation, "Exit of unknown app task worker");
            return;
        }
        let Some(slot) = self.live.remove(&app_id) else {
            return;
        };

        match exit.classify() {
            ExitClass::Success => {
                info!(app_id = %app_id, "App task completed");
            }
            ExitClass::HandledFailure => {
                warn!(app_id = %app_id, log_file = %slot.log_file.display(), "App task reported a failure");
                self.audit.app_task_crashed(&app_id, &slot.log_file).await;
            }
            ExitClass::Crash => {
                let message = format!("App task crashed with {}", exit);
                error!(app_id = %app_id, exit = %exit, log_file = %slot.log_file.display(), "App task crashed");

                if let Err(e) = self
                    .apps
                    .set_installation_state(&app_id, InstallationState::Error, &message)
                    .await
                {
                    error!(app_id = %app_id, error = %e, "Failed to set app state after crash");
                }
                self.audit.app_task_crashed(&app_id, &slot.log_file).await;
            }
        }

        self.locks.release(PLATFORM_LOCK);

        for waiter in self.stop_waiters.remove(&app_id).unwrap_or_default() {
            let _ = waiter.send(());
        }

        self.promote().await;
    }
}
