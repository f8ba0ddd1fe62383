//! Driver backed by the `claude` CLI speaking stream-json on both pipes.
//!
//! The process is spawned once per session with
//! `--output-format stream-json --input-format stream-json --verbose` and
//! stays alive across turns. User turns and interrupt requests are written
//! as JSONL to stdin; every stdout line is one JSON message. Tool-use
//! approval arrives as a `control_request` with subtype `can_use_tool` and
//! is answered with a `control_response` carrying the gate's verdict.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Driver, DriverEvent, DriverFactory, DriverOptions, PermissionGate};

/// Spawns one `claude` process per session.
pub struct ClaudeDriverFactory {
    pub executable: String,
}

impl Default for ClaudeDriverFactory {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
        }
    }
}

/// Map the opaque options onto CLI flags. Known keys get their dedicated
/// flags; anything else is passed through as `--key value`.
fn build_args(options: &DriverOptions) -> Vec<String> {
    let mut args = vec![
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    let as_str = |v: &Value| -> Option<String> {
        match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };
    let join_list = |v: &Value| -> Option<String> {
        v.as_array().map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join(",")
        })
    };

    for (key, value) in options {
        let flag_value = match key.as_str() {
            "model" => as_str(value).map(|v| ("--model", v)),
            "fallback_model" => as_str(value).map(|v| ("--fallback-model", v)),
            "permission_mode" => as_str(value).map(|v| ("--permission-mode", v)),
            "resume" => as_str(value).map(|v| ("--resume", v)),
            "max_turns" => as_str(value).map(|v| ("--max-turns", v)),
            "append_system_prompt" => as_str(value).map(|v| ("--append-system-prompt", v)),
            "allowed_tools" => join_list(value).map(|v| ("--allowedTools", v)),
            "disallowed_tools" => join_list(value).map(|v| ("--disallowedTools", v)),
            "continue_conversation" => {
                if value.as_bool() != Some(false) {
                    args.push("--continue".to_string());
                }
                None
            }
            _ => None,
        };
        match flag_value {
            Some((flag, v)) => {
                args.push(flag.to_string());
                args.push(v);
            }
            None if !is_known_key(key) => {
                // Unknown options pass through in CLI form.
                args.push(format!("--{}", key.replace('_', "-")));
                if let Some(v) = as_str(value) {
                    args.push(v);
                }
            }
            None => {}
        }
    }

    args
}

fn is_known_key(key: &str) -> bool {
    matches!(
        key,
        "model"
            | "fallback_model"
            | "permission_mode"
            | "resume"
            | "max_turns"
            | "append_system_prompt"
            | "allowed_tools"
            | "disallowed_tools"
            | "continue_conversation"
    )
}

#[async_trait]
impl DriverFactory for ClaudeDriverFactory {
    async fn start(
        &self,
        directory: &Path,
        options: &DriverOptions,
        events: mpsc::Sender<DriverEvent>,
        gate: Arc<dyn PermissionGate>,
    ) -> anyhow::Result<Box<dyn Driver>> {
        let args = build_args(options);
        debug!(executable = %self.executable, args = ?args, "spawning claude process");

        let mut child = Command::new(&self.executable)
            .args(&args)
            .current_dir(directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout missing"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdin missing"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!("[claude-stderr] {}", line);
                    }
                }
            });
        }

        let stdin = Arc::new(Mutex::new(stdin));
        let closing = Arc::new(AtomicBool::new(false));

        let reader_stdin = stdin.clone();
        let reader_closing = closing.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let message: Value = match serde_json::from_str(trimmed) {
                            Ok(v) => v,
                            Err(_) => {
                                debug!("unparseable driver line: {}", trimmed);
                                continue;
                            }
                        };
                        match message.get("type").and_then(Value::as_str) {
                            Some("control_request") => {
                                handle_control_request(
                                    &message,
                                    gate.as_ref(),
                                    reader_stdin.clone(),
                                );
                            }
                            Some("control_response") | Some("control_cancel_request") => {
                                debug!(message = %message, "driver control traffic");
                            }
                            _ => {
                                if events.send(DriverEvent::Message(message)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if !reader_closing.load(Ordering::SeqCst) {
                            let _ = events
                                .send(DriverEvent::Fatal(format!("driver read error: {e}")))
                                .await;
                        }
                        return;
                    }
                }
            }
            if !reader_closing.load(Ordering::SeqCst) {
                let _ = events
                    .send(DriverEvent::Fatal(
                        "claude process exited unexpectedly".to_string(),
                    ))
                    .await;
            }
        });

        Ok(Box::new(ClaudeDriver {
            stdin,
            child: Mutex::new(child),
            closing,
        }))
    }
}

/// Answer a `can_use_tool` request through the gate.
///
/// The gate publishes the pending permission before returning its future,
/// so the request is already visible to clients when we move the wait onto
/// its own task and the reader keeps draining stdout.
fn handle_control_request(
    message: &Value,
    gate: &dyn PermissionGate,
    stdin: Arc<Mutex<ChildStdin>>,
) {
    let request_id = message
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let request = message.get("request").cloned().unwrap_or(Value::Null);
    let subtype = request.get("subtype").and_then(Value::as_str);
    if subtype != Some("can_use_tool") {
        debug!(subtype = ?subtype, "ignoring driver control request");
        return;
    }
    let tool_name = request
        .get("tool_name")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let tool_input = request.get("input").cloned().unwrap_or(json!({}));

    let decision = gate.request(&tool_name, tool_input);
    tokio::spawn(async move {
        let verdict = decision.await;
        let frame = json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": verdict,
            },
        });
        if let Err(e) = write_line(&stdin, &frame).await {
            warn!(error = %e, "failed to deliver permission verdict to driver");
        }
    });
}

async fn write_line(stdin: &Mutex<ChildStdin>, frame: &Value) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

struct ClaudeDriver {
    stdin: Arc<Mutex<ChildStdin>>,
    child: Mutex<Child>,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl Driver for ClaudeDriver {
    async fn query(&self, text: &str) -> anyhow::Result<()> {
        let frame = json!({
            "type": "user",
            "message": {"role": "user", "content": text},
        });
        write_line(&self.stdin, &frame).await
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        let frame = json!({
            "type": "control_request",
            "request_id": Uuid::new_v4().to_string(),
            "request": {"subtype": "interrupt"},
        });
        write_line(&self.stdin, &frame).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        child.start_kill().ok();
        let _ = child.wait().await;
        Ok(())
    }
}
