/// Audit logging for privileged operations
///
/// Every policy the CLI installs, reconciles or removes is recorded as one
/// JSON line in the state directory.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    GeneratePolicy,
    ReconcilePolicy,
    ClearPolicy,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Server the policy belongs to
    pub server_id: String,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        server_id: impl Into<String>,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            server_id: server_id.into(),
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Opens the log in the state directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    #[cfg(test)]
    pub(crate) fn at(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    /// Appends an event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads up to `count` of the most recent events, newest first.
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }
}

async fn record(event: AuditEvent) {
    if let Ok(audit) = AuditLog::new()
        && let Err(e) = audit.log(event).await
    {
        tracing::warn!("Failed to write audit log: {}", e);
    }
}

/// Logs a generate + initial reconcile
pub async fn log_generate(server_id: &str, rule_count: usize, success: bool, error: Option<String>) {
    record(AuditEvent::new(
        EventType::GeneratePolicy,
        server_id,
        success,
        serde_json::json!({ "rule_count": rule_count }),
        error,
    ))
    .await;
}

/// Logs a failed periodic reconciliation; successful passes are not recorded
pub async fn log_reconcile_failure(server_id: &str, error: String) {
    record(AuditEvent::new(
        EventType::ReconcilePolicy,
        server_id,
        false,
        serde_json::json!({}),
        Some(error),
    ))
    .await;
}

/// Logs a teardown
pub async fn log_clear(server_id: &str, success: bool, error: Option<String>) {
    record(AuditEvent::new(
        EventType::ClearPolicy,
        server_id,
        success,
        serde_json::json!({}),
        error,
    ))
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::GeneratePolicy,
            "5f2a9c",
            false,
            serde_json::json!({"rule_count": 12}),
            Some("ipset create failed".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("generate_policy"));
        assert!(json.contains("5f2a9c"));
        assert!(json.contains("ipset create failed"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"clear_policy","server_id":"abc","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert!(matches!(event.event_type, EventType::ClearPolicy));
    }

    #[tokio::test]
    async fn test_log_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        for success in [true, false] {
            let event = AuditEvent::new(
                EventType::ReconcilePolicy,
                "abc",
                success,
                serde_json::json!({}),
                None,
            );
            audit.log(event).await.unwrap();
        }

        let events = audit.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events[0].success);
        assert!(events[1].success);
    }
}
