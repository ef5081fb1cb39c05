//! Audit logging to the event log
//!
//! Shared audit logger for all mbox components. Fault-tolerant: events are
//! always logged locally via tracing, and a failing event store never fails
//! the operation being audited.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::event::{AuditSource, EventEntry};
use crate::storage::EventLog;

/// Audit logger bound to one component
pub struct AuditLogger {
    events: Option<Arc<dyn EventLog>>,
    component: String,
}

impl AuditLogger {
    /// Create a new audit logger for a specific component
    pub fn new(events: Arc<dyn EventLog>, component: &str) -> Self {
        Self {
            events: Some(events),
            component: component.to_string(),
        }
    }

    /// Create a noop audit logger (for testing)
    /// Events only go to tracing.
    pub fn new_noop() -> Self {
        Self {
            events: None,
            component: String::new(),
        }
    }

    /// Record an audit event
    ///
    /// Returns the stored entry, or `None` when there is no event store or it
    /// rejected the write.
    pub async fn log(&self, action: &str, source: &AuditSource, data: Value) -> Option<EventEntry> {
        tracing::info!(
            target: "audit",
            component = %self.component,
            action = %action,
            source = %source.username,
            data = %data,
            "audit event"
        );

        let events = self.events.as_ref()?;
        match events.add(action, source, data).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(component = %self.component, action = %action, error = %e, "Failed to persist audit event");
                None
            }
        }
    }
}
