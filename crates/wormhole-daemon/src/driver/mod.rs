//! The opaque AI-agent driver interface consumed by sessions.
//!
//! A driver is started once per session and stays alive across turns. It
//! emits opaque JSON messages through a channel and asks for tool-use
//! approval through a [`PermissionGate`]. The daemon never interprets
//! driver payloads beyond the init and result envelopes.

pub mod claude;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Opaque driver options, as supplied by the control-plane `open` call.
pub type DriverOptions = serde_json::Map<String, Value>;

/// One item on a driver's message stream.
#[derive(Debug)]
pub enum DriverEvent {
    /// An opaque driver message, passed through to clients unchanged.
    Message(Value),
    /// The driver failed irrecoverably; the session transitions to `error`.
    Fatal(String),
}

/// Outcome of a permission check, in the shape the driver callback returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionVerdict {
    Allow {
        updated_input: Value,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

/// Tool-use gate the driver calls before executing a gated tool.
///
/// `request` publishes the pending permission synchronously — by the time
/// it returns, the request is visible to subscribed clients and resolvable
/// by id — and hands back a future that completes with the human decision.
/// The driver may keep reading its stream while that future is pending.
pub trait PermissionGate: Send + Sync {
    fn request(&self, tool_name: &str, tool_input: Value) -> BoxFuture<'static, PermissionVerdict>;
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Submit a user turn.
    async fn query(&self, text: &str) -> anyhow::Result<()>;

    /// Cancel the current turn. Safe to call when nothing is running.
    async fn interrupt(&self) -> anyhow::Result<()>;

    /// Release all driver resources.
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Begin an agent run in `directory`. Messages flow into `events`;
    /// tool-use approval flows through `gate`.
    async fn start(
        &self,
        directory: &Path,
        options: &DriverOptions,
        events: mpsc::Sender<DriverEvent>,
        gate: Arc<dyn PermissionGate>,
    ) -> anyhow::Result<Box<dyn Driver>>;
}
