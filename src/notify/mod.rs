//! Human-visible notification sink, kept as a thin collaborator trait
//! so a chat integration can be swapped in without touching the main
//! loop's alerting logic.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub text: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_message(&self, notification: Notification) -> Result<()>;
}

/// Default sink: logs at a level matching severity. Good enough for a
/// headless deployment with no chat integration configured.
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn send_message(&self, notification: Notification) -> Result<()> {
        match notification.severity {
            Severity::Info => info!(text = %notification.text, "notification"),
            Severity::Warning => warn!(text = %notification.text, "notification"),
            Severity::Critical => warn!(text = %notification.text, "CRITICAL notification"),
        }
        Ok(())
    }
}
