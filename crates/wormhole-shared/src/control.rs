//! Control-plane protocol: newline-delimited JSON over a local Unix socket.
//!
//! One request and one response per line. Errors are returned as
//! `{"error": {"code": ..., "message": ...}}` using the wire error codes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::SessionInfo;

/// Well-known control socket path: `$XDG_RUNTIME_DIR/wormhole.sock`,
/// falling back to `/tmp`.
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(runtime_dir).join("wormhole.sock")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlRequest {
    Open {
        #[serde(default)]
        name: Option<String>,
        directory: String,
        /// Opaque driver options, forwarded to the driver unchanged.
        #[serde(default)]
        options: Option<Value>,
    },
    Close {
        name: String,
    },
    List,
    Status,
    ResolveAttach {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlError {
    pub code: String,
    pub message: String,
}

/// Control responses are shaped by their fields rather than a tag; the
/// error form is tried first when decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Error {
        error: ControlError,
    },
    Status {
        port: u16,
        pid: u32,
        version: String,
        sessions: usize,
        clients: usize,
    },
    List {
        sessions: Vec<SessionInfo>,
    },
    ResolveAttach {
        driver_session_id: String,
    },
    Open {
        name: String,
    },
    Empty {},
}

impl ControlResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ControlResponse::Error {
            error: ControlError {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_roundtrip() {
        for req in [
            ControlRequest::Open {
                name: Some("s1".into()),
                directory: "/p".into(),
                options: None,
            },
            ControlRequest::Close { name: "s1".into() },
            ControlRequest::List,
            ControlRequest::Status,
            ControlRequest::ResolveAttach { name: "s1".into() },
        ] {
            let raw = serde_json::to_string(&req).unwrap();
            let back: ControlRequest = serde_json::from_str(&raw).unwrap();
            assert_eq!(req, back, "request: {raw}");
        }
    }

    #[test]
    fn open_without_name_or_options() {
        let req: ControlRequest =
            serde_json::from_str(r#"{"method":"open","directory":"/p"}"#).unwrap();
        assert_eq!(
            req,
            ControlRequest::Open {
                name: None,
                directory: "/p".into(),
                options: None,
            }
        );
    }

    #[test]
    fn error_response_shape() {
        let resp = ControlResponse::error(
            "SESSION_EXISTS",
            "A session already exists in this directory: s1",
        );
        let raw = serde_json::to_value(&resp).unwrap();
        assert_eq!(raw["error"]["code"], "SESSION_EXISTS");
        assert_eq!(
            raw["error"]["message"],
            "A session already exists in this directory: s1"
        );
        let back: ControlResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp, back);
    }

    #[test]
    fn responses_decode_by_shape() {
        let resp: ControlResponse = serde_json::from_str(r#"{"name":"demo-a1b2"}"#).unwrap();
        assert_eq!(
            resp,
            ControlResponse::Open {
                name: "demo-a1b2".into()
            }
        );

        let resp: ControlResponse = serde_json::from_str(
            r#"{"port":7117,"pid":42,"version":"0.1.0","sessions":1,"clients":0}"#,
        )
        .unwrap();
        assert!(matches!(resp, ControlResponse::Status { port: 7117, .. }));

        let resp: ControlResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp, ControlResponse::Empty {});

        let resp: ControlResponse =
            serde_json::from_str(r#"{"driver_session_id":"abc"}"#).unwrap();
        assert_eq!(
            resp,
            ControlResponse::ResolveAttach {
                driver_session_id: "abc".into()
            }
        );
    }
}
