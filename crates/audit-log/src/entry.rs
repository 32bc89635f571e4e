use serde::{Deserialize, Serialize};

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub source: AuditSource,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRecord>,
}

impl AuditEntry {
    /// Create an entry stamped with a fresh UUID v4 and the current UTC time.
    pub fn new(
        event_type: AuditEventType,
        source: AuditSource,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            source,
            details,
            tool_call: None,
        }
    }

    /// Attach the tool call this entry is about.
    pub fn with_tool_call(mut self, record: ToolCallRecord) -> Self {
        self.tool_call = Some(record);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionOpened,
    SessionClosed,
    HandshakeRejected,
    UpstreamRejected,
    PolicyEnforced,
    EventDropped,
    ToolDispatched,
    ToolSucceeded,
    ToolFailed,
    ProcessStarted,
    ProcessStopped,
}

/// Which component emitted the entry, and for which relay session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
}

impl AuditSource {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            session_id: None,
            remote_addr: None,
        }
    }

    /// Scope the source to one relay session.
    pub fn for_session(
        component: impl Into<String>,
        session_id: impl ToString,
        remote_addr: impl ToString,
    ) -> Self {
        Self {
            component: component.into(),
            session_id: Some(session_id.to_string()),
            remote_addr: Some(remote_addr.to_string()),
        }
    }
}

/// The tool invocation an entry refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// `to_server` or `to_client`.
    pub direction: String,
}
