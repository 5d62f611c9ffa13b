//! Security audit trail
//!
//! Every policy decision the bridge takes (session lifecycle, rejected
//! commands and queries, detected threats, rejected frames) is written as
//! one JSON line on the `gapbridge::audit` tracing target, so operators
//! can route it separately from the diagnostic log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::ProtocolFamily;
use crate::session::SessionId;

/// Tracing target for audit records
pub const AUDIT_TARGET: &str = "gapbridge::audit";

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Informational message
    Info = 1,
    /// Warning message
    Warning = 2,
    /// Error condition
    Error = 3,
    /// Critical error
    Critical = 4,
}

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    /// Downstream connection accepted or backend connected
    SessionOpened,
    /// Session torn down
    SessionClosed,
    /// FTP command refused by policy
    CommandRejected,
    /// SQL refused by policy
    QueryRejected,
    /// Content scanner matched
    ThreatDetected,
    /// Inbound frame failed decoding or authentication
    FrameRejected,
    /// Backend could not be reached
    BackendUnavailable,
    /// Inbound connection from an address not allowed to make it
    ConnectionRefused,
}

/// Audit event structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Event ID
    pub event_id: Uuid,
    /// Session the event belongs to, if any
    pub session_id: Option<SessionId>,
    /// Protocol family, if known
    pub protocol: Option<ProtocolFamily>,
    /// Action performed
    pub action: AuditAction,
    /// Free-form reason or description
    pub detail: Option<String>,
    /// Client or backend address
    pub peer: Option<String>,
}

impl AuditEvent {
    /// Create new audit event
    pub fn new(action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: Uuid::new_v4(),
            session_id: None,
            protocol: None,
            action,
            detail: None,
            peer: None,
        }
    }

    /// Set session ID
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set protocol family
    pub fn with_protocol(mut self, protocol: ProtocolFamily) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set detail text
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set peer address
    pub fn with_peer(mut self, peer: impl ToString) -> Self {
        self.peer = Some(peer.to_string());
        self
    }

    pub fn severity(&self) -> Severity {
        match self.action {
            AuditAction::SessionOpened | AuditAction::SessionClosed => Severity::Info,
            AuditAction::CommandRejected | AuditAction::QueryRejected | AuditAction::ConnectionRefused => {
                Severity::Warning
            }
            AuditAction::FrameRejected | AuditAction::BackendUnavailable => Severity::Error,
            AuditAction::ThreatDetected => Severity::Critical,
        }
    }
}

/// Emits audit events as structured JSON
#[derive(Debug, Clone)]
pub struct AuditLogger {
    /// Which bridge side writes the records
    source: &'static str,
}

impl AuditLogger {
    pub fn new(source: &'static str) -> Self {
        Self { source }
    }

    /// Create structured log entry
    pub fn create_log_entry(&self, event: &AuditEvent) -> serde_json::Value {
        serde_json::json!({
            "timestamp": event.timestamp.to_rfc3339(),
            "event_id": event.event_id.to_string(),
            "source": self.source,
            "event_type": format!("{:?}", event.action),
            "severity": format!("{:?}", event.severity()),
            "session_id": event.session_id.map(|id| id.to_string()),
            "protocol": event.protocol.map(|p| p.to_string()),
            "peer": event.peer,
            "detail": event.detail,
            "device_version": env!("CARGO_PKG_VERSION"),
        })
    }

    /// Log audit event
    pub fn record(&self, event: AuditEvent) {
        let entry = self.create_log_entry(&event).to_string();
        match event.severity() {
            Severity::Info => tracing::info!(target: AUDIT_TARGET, "{}", entry),
            Severity::Warning => tracing::warn!(target: AUDIT_TARGET, "{}", entry),
            Severity::Error | Severity::Critical => tracing::error!(target: AUDIT_TARGET, "{}", entry),
        }
    }
}
