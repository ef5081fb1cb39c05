//! Singleton platform tasks.
//!
//! At most one worker per task type runs at a time. Each type is bound to an
//! operation lock taken exclusively for the whole run, a log file, a worker
//! program and a pair of audit actions. The task id is the task type.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mbox_log::AuditSource;
use mbox_log::event::{
    ACTION_BACKUP_FINISH, ACTION_BACKUP_START, ACTION_CERTIFICATE_RENEWAL_FINISH,
    ACTION_CERTIFICATE_RENEWAL_START, ACTION_DASHBOARD_DNS_FINISH, ACTION_DASHBOARD_DNS_START,
    ACTION_UPDATE_FINISH, ACTION_UPDATE_START,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::audit::TaskAuditLogger;
use crate::config::Paths;
use crate::error::{Error, Result};
use crate::exit::{ExitClass, WorkerExit};
use crate::lock::{LockRegistry, PLATFORM_LOCK};
use crate::logs::{self, LogLine};
use crate::process::{DATA_DIR_ENV, Launcher, WorkerControl, WorkerSpec, open_log_file};
use crate::progress::{ProgressStore, ProgressUpdate, TaskRecord};

pub const TASK_BACKUP: &str = "backup";
pub const TASK_UPDATE: &str = "update";
pub const TASK_RENEW_CERTS: &str = "renewcerts";
pub const TASK_DASHBOARD_DNS: &str = "dashboardDns";

/// Lock of the dashboard DNS task. Record updates do not conflict with
/// app workers or platform maintenance.
pub const DASHBOARD_DNS_LOCK: &str = "dashboard-dns";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Handed to `on_failure` when a run ends with a recorded error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_type: String,
    pub message: String,
}

pub type OnFailure = Arc<dyn Fn(TaskFailure) + Send + Sync>;

#[derive(Clone)]
pub struct TaskDefinition {
    pub task_type: String,
    pub lock: String,
    pub log_file: PathBuf,
    pub program: PathBuf,
    /// Passed after the task type and before the caller's args.
    pub args: Vec<String>,
    pub on_failure: Option<OnFailure>,
    pub start_action: String,
    pub finish_action: String,
}

impl TaskDefinition {
    /// Platform-locked task of `task_type` run by the shared task program.
    pub fn platform(
        paths: &Paths,
        task_type: &str,
        start_action: &str,
        finish_action: &str,
    ) -> Self {
        Self {
            task_type: task_type.to_string(),
            lock: PLATFORM_LOCK.to_string(),
            log_file: paths.task_log_file(task_type),
            program: paths.task_program.clone(),
            args: Vec::new(),
            on_failure: None,
            start_action: start_action.to_string(),
            finish_action: finish_action.to_string(),
        }
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = Some(on_failure);
        self
    }
}

/// Static table of runnable task types.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    definitions: HashMap<String, TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: TaskDefinition) {
        self.definitions
            .insert(definition.task_type.clone(), definition);
    }

    pub fn get(&self, task_type: &str) -> Option<&TaskDefinition> {
        self.definitions.get(task_type)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    /// Backup, update and certificate renewal take the platform lock and
    /// raise an alert on failure. Dashboard DNS setup runs under its own lock.
    pub fn standard(paths: &Paths, audit: &TaskAuditLogger) -> Self {
        let alert = |audit: TaskAuditLogger| -> OnFailure {
            Arc::new(move |failure: TaskFailure| {
                let audit = audit.clone();
                tokio::spawn(async move {
                    audit.alert(&failure.task_type, &failure.message).await;
                });
            })
        };

        let mut registry = Self::new();
        registry.register(
            TaskDefinition::platform(paths, TASK_BACKUP, ACTION_BACKUP_START, ACTION_BACKUP_FINISH)
                .with_on_failure(alert(audit.clone())),
        );
        registry.register(
            TaskDefinition::platform(paths, TASK_UPDATE, ACTION_UPDATE_START, ACTION_UPDATE_FINISH)
                .with_on_failure(alert(audit.clone())),
        );
        registry.register(
            TaskDefinition::platform(
                paths,
                TASK_RENEW_CERTS,
                ACTION_CERTIFICATE_RENEWAL_START,
                ACTION_CERTIFICATE_RENEWAL_FINISH,
            )
            .with_on_failure(alert(audit.clone())),
        );

        let mut dashboard_dns = TaskDefinition::platform(
            paths,
            TASK_DASHBOARD_DNS,
            ACTION_DASHBOARD_DNS_START,
            ACTION_DASHBOARD_DNS_FINISH,
        );
        dashboard_dns.lock = DASHBOARD_DNS_LOCK.to_string();
        registry.register(dashboard_dns);

        registry
    }
}

/// Progress plus whether a worker is live right now.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    #[serde(flatten)]
    pub record: TaskRecord,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Started {
        task_id: String,
    },
    Finished {
        task_id: String,
        error: Option<String>,
        result: Option<String>,
        exit: WorkerExit,
    },
}

struct RunningTask {
    generation: u64,
    control: WorkerControl,
}

/// State the exit watcher needs after `start_task` has returned.
#[derive(Clone)]
struct Shared {
    locks: Arc<LockRegistry>,
    progress: ProgressStore,
    audit: TaskAuditLogger,
    running: Arc<RwLock<HashMap<String, RunningTask>>>,
    events_tx: broadcast::Sender<TaskEvent>,
}

pub struct TaskRunner {
    registry: TaskRegistry,
    launcher: Arc<dyn Launcher>,
    data_dir: PathBuf,
    generation: AtomicU64,
    shared: Shared,
}

impl TaskRunner {
    pub fn new(
        registry: TaskRegistry,
        locks: Arc<LockRegistry>,
        progress: ProgressStore,
        audit: TaskAuditLogger,
        launcher: Arc<dyn Launcher>,
        data_dir: PathBuf,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            launcher,
            data_dir,
            generation: AtomicU64::new(0),
            shared: Shared {
                locks,
                progress,
                audit,
                running: Arc::new(RwLock::new(HashMap::new())),
                events_tx,
            },
        }
    }

    /// Start `task_type` and return its task id without waiting for it.
    pub async fn start_task(
        &self,
        task_type: &str,
        args: Vec<String>,
        source: &AuditSource,
    ) -> Result<String> {
        let definition = self
            .registry
            .get(task_type)
            .ok_or_else(|| Error::NotFound(format!("task type {}", task_type)))?;

        if self.shared.running.read().await.contains_key(task_type) {
            return Err(Error::BadState(format!("task {} is already running", task_type)));
        }

        self.shared
            .locks
            .acquire_exclusive(&definition.lock)
            .map_err(|e| Error::BadState(e.to_string()))?;

        if let Err(e) = self.spawn(definition, args, source).await {
            error!(task = %task_type, error = %e, "Failed to start task");
            self.shared.locks.release(&definition.lock);
            return Err(e);
        }

        Ok(task_type.to_string())
    }

    async fn spawn(
        &self,
        definition: &TaskDefinition,
        args: Vec<String>,
        source: &AuditSource,
    ) -> Result<()> {
        let task_id = definition.task_type.clone();
        let args_json = json!(args);

        // Nothing is recorded for a run that cannot even open its log
        let log = open_log_file(&definition.log_file).await?;

        self.shared.progress.reset(&task_id, &args_json).await?;
        self.shared
            .audit
            .task_started(&definition.start_action, source, &task_id, &args_json)
            .await;

        let mut worker_args = vec![task_id.clone()];
        worker_args.extend(definition.args.iter().cloned());
        worker_args.extend(args);

        let launched = self
            .launcher
            .launch(WorkerSpec {
                program: definition.program.clone(),
                args: worker_args,
                env: vec![(
                    DATA_DIR_ENV.to_string(),
                    self.data_dir.display().to_string(),
                )],
                log,
            })
            .await;

        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                self.record_launch_failure(definition, source, &e).await;
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.running.write().await.insert(
            task_id.clone(),
            RunningTask {
                generation,
                control: handle.control,
            },
        );

        info!(task = %task_id, user = %source.username, "Task started");
        let _ = self.shared.events_tx.send(TaskEvent::Started {
            task_id: task_id.clone(),
        });

        let shared = self.shared.clone();
        let definition = definition.clone();
        let source = source.clone();
        let exit_rx = handle.exit;
        tokio::spawn(async move {
            let exit = match exit_rx.await {
                Ok(exit) => exit,
                Err(_) => {
                    error!(task = %task_id, "Worker exit channel closed without a status");
                    WorkerExit::Code(-1)
                }
            };
            shared.finish(&definition, &source, generation, exit).await;
        });

        Ok(())
    }

    /// Close the run opened by `spawn` so the start event has a matching
    /// finish and the record carries the error.
    async fn record_launch_failure(
        &self,
        definition: &TaskDefinition,
        source: &AuditSource,
        err: &Error,
    ) {
        let task_id = &definition.task_type;
        let message = format!("Failed to start task: {}", err);

        if let Err(e) = self
            .shared
            .progress
            .update(task_id, ProgressUpdate::failed(message.clone()))
            .await
        {
            warn!(task = %task_id, error = %e, "Failed to record launch failure");
        }
        self.shared
            .audit
            .task_finished(&definition.finish_action, source, task_id, Some(&message), None)
            .await;
    }

    /// Ask the running worker of `task_type` to stop. Cleanup happens when it exits.
    pub async fn stop_task(&self, task_type: &str, source: &AuditSource) -> Result<()> {
        if self.registry.get(task_type).is_none() {
            return Err(Error::NotFound(format!("task type {}", task_type)));
        }

        let running = self.shared.running.read().await;
        let task = running
            .get(task_type)
            .ok_or_else(|| Error::BadState(format!("task {} is not active", task_type)))?;

        info!(task = %task_type, user = %source.username, "Stopping task");
        if !task.control.terminate() {
            debug!(task = %task_type, "Worker already exited");
        }
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<TaskInfo> {
        let record = self.shared.progress.get(task_id).await?;
        let active = self.is_active(task_id).await;
        Ok(TaskInfo { record, active })
    }

    pub async fn list(&self) -> Result<Vec<TaskInfo>> {
        let records = self.shared.progress.list().await?;
        let running = self.shared.running.read().await;
        Ok(records
            .into_iter()
            .map(|record| TaskInfo {
                active: running.contains_key(&record.id),
                record,
            })
            .collect())
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.shared.running.read().await.contains_key(task_id)
    }

    /// Last `lines` lines of the task's log file.
    pub async fn logs(&self, task_type: &str, lines: usize) -> Result<Vec<LogLine>> {
        let definition = self
            .registry
            .get(task_type)
            .ok_or_else(|| Error::NotFound(format!("task type {}", task_type)))?;

        logs::tail(&definition.log_file, lines, task_type).await
    }

    /// Like [`logs`](Self::logs), then keeps streaming lines as the worker
    /// writes them until the receiver is dropped.
    pub fn follow_logs(
        &self,
        task_type: &str,
        lines: usize,
    ) -> Result<mpsc::Receiver<LogLine>> {
        let definition = self
            .registry
            .get(task_type)
            .ok_or_else(|| Error::NotFound(format!("task type {}", task_type)))?;

        Ok(logs::follow(
            definition.log_file.clone(),
            lines,
            task_type.to_string(),
            logs::FOLLOW_POLL_INTERVAL,
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }
}

impl Shared {
    /// Runs exactly once per worker, after it exited.
    async fn finish(
        &self,
        definition: &TaskDefinition,
        source: &AuditSource,
        generation: u64,
        exit: WorkerExit,
    ) {
        let task_id = &definition.task_type;

        let (error, result) = match self.progress.get(task_id).await {
            Ok(record) => (record.error().map(str::to_string), record.result),
            Err(e) => {
                warn!(task = %task_id, error = %e, "Failed to read final task progress");
                (None, None)
            }
        };

        // Failure is decided by the recorded error alone
        if exit.classify() == ExitClass::Crash && error.is_none() {
            warn!(task = %task_id, exit = %exit, "Task worker crashed without recording an error, reporting success");
        }

        match &error {
            Some(message) => warn!(task = %task_id, exit = %exit, error = %message, "Task failed"),
            None => info!(task = %task_id, exit = %exit, "Task finished"),
        }

        self.audit
            .task_finished(
                &definition.finish_action,
                source,
                task_id,
                error.as_deref(),
                result.as_deref(),
            )
            .await;

        {
            let mut running = self.running.write().await;
            if running.get(task_id).map(|t| t.generation) == Some(generation) {
                running.remove(task_id);
            }
        }

        self.locks.release(&definition.lock);

        if let (Some(message), Some(on_failure)) = (&error, &definition.on_failure) {
            on_failure(TaskFailure {
                task_type: task_id.clone(),
                message: message.clone(),
            });
        }

        let _ = self.events_tx.send(TaskEvent::Finished {
            task_id: task_id.clone(),
            error,
            result,
            exit,
        });
    }
}
