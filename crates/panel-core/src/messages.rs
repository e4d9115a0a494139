//! Wire-level message types.
//!
//! Console stream, server → client (JSON text frames):
//!
//! ```text
//! { "type": "snapshot", "entries": [{"seq": N, "line": "..."}], "reset": bool }
//! { "type": "log", "seq": N, "line": "..." }
//! ```
//!
//! Client → server frames are raw text, one command per frame.

use serde::{Deserialize, Serialize};

/// One sequence-numbered console line. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Strictly increasing, 1-based, per process.
    pub seq: u64,
    pub line: String,
}

impl LogEntry {
    pub fn new(seq: u64, line: impl Into<String>) -> Self {
        Self {
            seq,
            line: line.into(),
        }
    }
}

/// Messages sent downstream on a console stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Base state, always the first message on a connection.
    Snapshot { entries: Vec<LogEntry>, reset: bool },
    /// A single live entry.
    Log { seq: u64, line: String },
}

impl ServerMessage {
    pub fn snapshot(entries: Vec<LogEntry>, reset: bool) -> Self {
        ServerMessage::Snapshot { entries, reset }
    }

    pub fn log(entry: LogEntry) -> Self {
        ServerMessage::Log {
            seq: entry.seq,
            line: entry.line,
        }
    }

    pub fn to_json(&self) -> crate::PanelResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::PanelResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| crate::PanelError::InvalidMessage(format!("bad console frame: {e}")))
    }
}

/// Body of `POST /api/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Response of the login/logout/session endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds until another login attempt is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl AuthStatus {
    pub fn authenticated(identity: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            identity: Some(identity.into()),
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            authenticated: false,
            identity: None,
            error: Some("rate_limited".to_string()),
            retry_after: Some(retry_after_secs),
        }
    }
}

/// Entry of `GET /api/servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: String,
    pub running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_wire_shape() {
        let msg = ServerMessage::snapshot(vec![LogEntry::new(1, "Done (3.2s)!")], true);
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "snapshot",
                "entries": [{"seq": 1, "line": "Done (3.2s)!"}],
                "reset": true
            })
        );
    }

    #[test]
    fn log_wire_shape() {
        let msg = ServerMessage::log(LogEntry::new(7, "> say hi"));
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"log","seq":7,"line":"> say hi"}"#
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = ServerMessage::from_json(r#"{"type":"lines","data":"x"}"#).unwrap_err();
        assert!(matches!(err, crate::PanelError::InvalidMessage(_)));
    }

    #[test]
    fn auth_status_omits_empty_fields() {
        let json = serde_json::to_string(&AuthStatus::anonymous()).unwrap();
        assert_eq!(json, r#"{"authenticated":false}"#);

        let json = serde_json::to_string(&AuthStatus::rate_limited(30)).unwrap();
        assert_eq!(
            json,
            r#"{"authenticated":false,"error":"rate_limited","retryAfter":30}"#
        );
    }
}
