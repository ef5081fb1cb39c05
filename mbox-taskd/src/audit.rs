//! Task-specific audit logging
//!
//! Wraps the shared AuditLogger with task and app-task convenience methods.

use std::path::Path;
use std::sync::Arc;

use mbox_log::event::{ACTION_ALERT, ACTION_APP_TASK_CRASH};
use mbox_log::{AuditLogger, AuditSource, EventEntry, EventLog};
use serde_json::{Value, json};

/// Username recorded for events the supervisors raise on their own.
pub const SYSTEM_USER: &str = "taskmanager";

/// Task audit logger with domain-specific methods
#[derive(Clone)]
pub struct TaskAuditLogger {
    inner: Arc<AuditLogger>,
}

impl TaskAuditLogger {
    pub fn new(events: Arc<dyn EventLog>) -> Self {
        Self {
            inner: Arc::new(AuditLogger::new(events, "taskd")),
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            inner: Arc::new(AuditLogger::new_noop()),
        }
    }

    // === Platform Tasks ===

    pub async fn task_started(
        &self,
        action: &str,
        source: &AuditSource,
        task_id: &str,
        args: &Value,
    ) -> Option<EventEntry> {
        self.inner
            .log(action, source, json!({ "taskId": task_id, "args": args }))
            .await
    }

    pub async fn task_finished(
        &self,
        action: &str,
        source: &AuditSource,
        task_id: &str,
        error_message: Option<&str>,
        result: Option<&str>,
    ) -> Option<EventEntry> {
        self.inner
            .log(
                action,
                source,
                json!({
                    "taskId": task_id,
                    "errorMessage": error_message,
                    "result": result,
                }),
            )
            .await
    }

    /// Failure notification raised by platform task `on_failure` callbacks.
    pub async fn alert(&self, task_type: &str, message: &str) -> Option<EventEntry> {
        self.inner
            .log(
                ACTION_ALERT,
                &AuditSource::system(SYSTEM_USER),
                json!({ "taskType": task_type, "message": message }),
            )
            .await
    }

    // === App Tasks ===

    pub async fn app_task_crashed(&self, app_id: &str, log_file: &Path) -> Option<EventEntry> {
        self.inner
            .log(
                ACTION_APP_TASK_CRASH,
                &AuditSource::system(SYSTEM_USER),
                json!({
                    "appId": app_id,
                    "crashLogFile": log_file.display().to_string(),
                }),
            )
            .await
    }
}
