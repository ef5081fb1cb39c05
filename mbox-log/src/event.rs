//! Event log entry types and well-known action ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Platform task actions
pub const ACTION_BACKUP_START: &str = "backup.start";
pub const ACTION_BACKUP_FINISH: &str = "backup.finish";
pub const ACTION_UPDATE_START: &str = "box.update.start";
pub const ACTION_UPDATE_FINISH: &str = "box.update.finish";
pub const ACTION_CERTIFICATE_RENEWAL_START: &str = "certificate.renewal.start";
pub const ACTION_CERTIFICATE_RENEWAL_FINISH: &str = "certificate.renewal.finish";
pub const ACTION_DASHBOARD_DNS_START: &str = "dashboard.dns.start";
pub const ACTION_DASHBOARD_DNS_FINISH: &str = "dashboard.dns.finish";

// App task actions
pub const ACTION_APP_TASK_CRASH: &str = "app.task.crash";

/// Raised by failure callbacks of platform tasks.
pub const ACTION_ALERT: &str = "platform.alert";

/// Who triggered an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSource {
    pub user_id: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl AuditSource {
    /// Source for operations started by the platform itself (cron, supervisors)
    pub fn system(username: &str) -> Self {
        Self {
            user_id: None,
            username: username.to_string(),
            ip: None,
        }
    }

    /// Source for operations requested by a user
    pub fn user(user_id: &str, username: &str, ip: Option<&str>) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            username: username.to_string(),
            ip: ip.map(str::to_string),
        }
    }
}

/// A single persisted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEntry {
    pub id: String,
    pub action: String,
    pub source: AuditSource,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}
