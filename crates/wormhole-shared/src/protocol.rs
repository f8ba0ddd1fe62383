//! WebSocket wire protocol between clients and the daemon.
//!
//! One JSON object per text frame, tagged by `type`, snake_case fields.
//! Unknown message types fail to parse (protocol error); unknown fields
//! inside a known type are ignored for forward compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error codes carried by `error` frames and daemon logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionExists,
    SessionNotFound,
    DriverError,
    /// Reserved; never emitted by this version.
    PermissionTimeout,
    WebsocketError,
    InvalidMessage,
    NotSubscribed,
    Backpressure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SessionExists => "SESSION_EXISTS",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::DriverError => "DRIVER_ERROR",
            ErrorCode::PermissionTimeout => "PERMISSION_TIMEOUT",
            ErrorCode::WebsocketError => "WEBSOCKET_ERROR",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::NotSubscribed => "NOT_SUBSCRIBED",
            ErrorCode::Backpressure => "BACKPRESSURE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Working,
    AwaitingApproval,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Working => "working",
            SessionState::AwaitingApproval => "awaiting_approval",
            SessionState::Error => "error",
        }
    }
}

/// Human decision on a pending permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// Session-level actions that are not free-form input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Interrupt,
    Compact,
    Clear,
    Plan,
}

/// Target of a `subscribe` frame: `"*"` or an explicit list of names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscribeTarget {
    Wildcard(String),
    Sessions(Vec<String>),
}

// === Client → daemon ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        client_version: String,
        device_name: String,
    },
    Subscribe {
        sessions: SubscribeTarget,
    },
    Input {
        session: String,
        text: String,
    },
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
    },
    Control {
        session: String,
        action: ControlAction,
    },
    Sync {
        session: String,
        last_seen_sequence: u64,
    },
}

// === Daemon → client ===

/// One driver message wrapped with its session-scoped sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub session: String,
    pub sequence: u64,
    #[serde(with = "crate::timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Opaque driver payload, passed through unchanged.
    pub message: Value,
}

/// A pending permission request, replayed to reconnecting clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPermissionInfo {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub session_name: String,
    #[serde(with = "crate::timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Snapshot of one session, sent in `welcome` and over the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub directory: String,
    pub state: SessionState,
    pub claude_session_id: Option<String>,
    pub cost_usd: f64,
    #[serde(default, with = "crate::timestamp::option")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_permissions: Vec<PendingPermissionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        server_version: String,
        machine_name: String,
        sessions: Vec<SessionInfo>,
    },
    Event(EventFrame),
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: Value,
        session_name: String,
    },
    SyncResponse {
        session: String,
        events: Vec<EventFrame>,
        truncated: bool,
        #[serde(default)]
        pending_permissions: Vec<PendingPermissionInfo>,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            session: None,
        }
    }

    pub fn session_error(
        code: ErrorCode,
        message: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            session: Some(session.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip_client(msg: &ClientMessage) {
        let raw = serde_json::to_string(msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(*msg, back, "frame: {raw}");
    }

    fn roundtrip_server(msg: &ServerMessage) {
        let raw = serde_json::to_string(msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(*msg, back, "frame: {raw}");
    }

    #[test]
    fn client_messages_roundtrip() {
        roundtrip_client(&ClientMessage::Hello {
            client_version: "1.0.0".into(),
            device_name: "phone-a".into(),
        });
        roundtrip_client(&ClientMessage::Subscribe {
            sessions: SubscribeTarget::Wildcard("*".into()),
        });
        roundtrip_client(&ClientMessage::Subscribe {
            sessions: SubscribeTarget::Sessions(vec!["demo".into(), "other".into()]),
        });
        roundtrip_client(&ClientMessage::Input {
            session: "demo".into(),
            text: "hello".into(),
        });
        roundtrip_client(&ClientMessage::PermissionResponse {
            request_id: "R1".into(),
            decision: PermissionDecision::Allow,
        });
        roundtrip_client(&ClientMessage::Control {
            session: "demo".into(),
            action: ControlAction::Interrupt,
        });
        roundtrip_client(&ClientMessage::Sync {
            session: "demo".into(),
            last_seen_sequence: 7,
        });
    }

    #[test]
    fn server_messages_roundtrip() {
        roundtrip_server(&ServerMessage::Welcome {
            server_version: "0.1.0".into(),
            machine_name: "host".into(),
            sessions: vec![SessionInfo {
                name: "demo".into(),
                directory: "/tmp/demo".into(),
                state: SessionState::Idle,
                claude_session_id: None,
                cost_usd: 0.0,
                last_activity: None,
                pending_permissions: vec![],
            }],
        });
        roundtrip_server(&ServerMessage::Event(EventFrame {
            session: "demo".into(),
            sequence: 3,
            timestamp: chrono::Utc::now(),
            message: json!({"type": "assistant", "text": "hi"}),
        }));
        roundtrip_server(&ServerMessage::PermissionRequest {
            request_id: "R1".into(),
            tool_name: "Write".into(),
            tool_input: json!({"file_path": "a.txt", "content": "x"}),
            session_name: "demo".into(),
        });
        roundtrip_server(&ServerMessage::SyncResponse {
            session: "demo".into(),
            events: vec![],
            truncated: true,
            pending_permissions: vec![],
        });
        roundtrip_server(&ServerMessage::session_error(
            ErrorCode::SessionNotFound,
            "Session not found: x",
            "x",
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<ServerMessage>(r#"{"type":"bogus"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"input","session":"demo","text":"hi","future_field":42}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Input {
                session: "demo".into(),
                text: "hi".into(),
            }
        );
    }

    #[test]
    fn wire_shapes_match_protocol() {
        let raw = serde_json::to_value(ServerMessage::error(
            ErrorCode::Backpressure,
            "client outbound queue overflow",
        ))
        .unwrap();
        assert_eq!(raw["type"], "error");
        assert_eq!(raw["code"], "BACKPRESSURE");
        assert!(raw.get("session").is_none());

        let hello: ClientMessage = serde_json::from_str(
            r#"{"type":"hello","client_version":"1.0.0","device_name":"phone-a"}"#,
        )
        .unwrap();
        assert!(matches!(hello, ClientMessage::Hello { .. }));

        let raw = serde_json::to_value(ClientMessage::Subscribe {
            sessions: SubscribeTarget::Wildcard("*".into()),
        })
        .unwrap();
        assert_eq!(raw["sessions"], "*");

        let raw = serde_json::to_value(SessionState::AwaitingApproval).unwrap();
        assert_eq!(raw, "awaiting_approval");
    }
}
