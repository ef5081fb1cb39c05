//! mbox-log: event log library
//!
//! Persistent audit trail for all mbox components. Every supervisor writes its
//! lifecycle events (task started, task finished, app task crashed, alerts)
//! through an [`EventLog`], and operators read them back to find out how a
//! background operation ended.
//!
//! # Example (AuditLogger - recommended)
//! ```ignore
//! use mbox_log::{AuditLogger, AuditSource, SqliteEventLog};
//!
//! let events = Arc::new(SqliteEventLog::new(pool).await?);
//! let audit = AuditLogger::new(events, "taskd");
//! audit.log("backup.start", &AuditSource::system("cron"), json!({ "taskId": "backup" })).await;
//! ```

mod audit;
pub mod event;
pub mod storage;

// Re-export commonly used types at crate root
pub use audit::AuditLogger;
pub use event::{AuditSource, EventEntry};
pub use storage::{EventLog, EventLogError, SqliteEventLog};
