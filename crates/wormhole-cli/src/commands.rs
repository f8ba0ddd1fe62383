//! Command implementations behind the `wormhole` binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde_json::{Map, Value};
use wormhole_shared::control::{socket_path, ControlRequest, ControlResponse};

use crate::client::send_request;

pub async fn open(
    name: Option<String>,
    directory: Option<PathBuf>,
    driver_args: Vec<String>,
) -> anyhow::Result<()> {
    ensure_daemon_running().await?;

    let directory = match directory {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let options = parse_driver_options(&driver_args);
    let request = ControlRequest::Open {
        name,
        directory: directory.to_string_lossy().into_owned(),
        options: if options.is_empty() {
            None
        } else {
            Some(Value::Object(options))
        },
    };

    match send_request(&socket_path(), &request).await {
        ControlResponse::Open { name } => {
            println!("Session '{name}' created");
            println!("  Directory: {}", directory.display());
            Ok(())
        }
        ControlResponse::Error { error } => bail!("{}", error.message),
        other => bail!("unexpected response: {other:?}"),
    }
}

pub async fn close(name: String) -> anyhow::Result<()> {
    match send_request(&socket_path(), &ControlRequest::Close { name: name.clone() }).await {
        ControlResponse::Empty {} => {
            println!("Session '{name}' closed");
            Ok(())
        }
        ControlResponse::Error { error } => bail!("{}", error.message),
        other => bail!("unexpected response: {other:?}"),
    }
}

pub async fn list() -> anyhow::Result<()> {
    ensure_daemon_running().await?;
    match send_request(&socket_path(), &ControlRequest::List).await {
        ControlResponse::List { sessions } => {
            if sessions.is_empty() {
                println!("No active sessions");
                return Ok(());
            }
            println!("Active sessions:");
            for session in sessions {
                println!(
                    "  {} [{}] - {}",
                    session.name,
                    session.state.as_str(),
                    session.directory
                );
                if session.cost_usd > 0.0 {
                    println!("    Cost: ${:.4}", session.cost_usd);
                }
                for pending in &session.pending_permissions {
                    println!("    Awaiting approval: {}", pending.tool_name);
                }
            }
            Ok(())
        }
        ControlResponse::Error { error } => bail!("{}", error.message),
        other => bail!("unexpected response: {other:?}"),
    }
}

pub async fn status() -> anyhow::Result<()> {
    match send_request(&socket_path(), &ControlRequest::Status).await {
        ControlResponse::Status {
            port,
            pid,
            version,
            sessions,
            clients,
        } => {
            println!("Daemon: running");
            println!("  Version: {version}");
            println!("  Port: {port}");
            println!("  Pid: {pid}");
            println!("  Sessions: {sessions}");
            println!("  Connected clients: {clients}");
            Ok(())
        }
        ControlResponse::Error { error } => {
            println!("Daemon: not running");
            bail!("{}", error.message)
        }
        other => bail!("unexpected response: {other:?}"),
    }
}

/// Open an interactive terminal bound to the session's own conversation.
/// The daemon session stays alive when the terminal exits.
pub async fn attach(name: String, use_screen: bool) -> anyhow::Result<()> {
    ensure_daemon_running().await?;

    let driver_session_id =
        match send_request(&socket_path(), &ControlRequest::ResolveAttach { name: name.clone() })
            .await
        {
            ControlResponse::ResolveAttach { driver_session_id } => driver_session_id,
            ControlResponse::Error { error } => bail!("{}", error.message),
            other => bail!("unexpected response: {other:?}"),
        };

    let directory = match send_request(&socket_path(), &ControlRequest::List).await {
        ControlResponse::List { sessions } => sessions
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| PathBuf::from(s.directory))
            .ok_or_else(|| anyhow!("Session not found: {name}"))?,
        ControlResponse::Error { error } => bail!("{}", error.message),
        other => bail!("unexpected response: {other:?}"),
    };

    let status = if use_screen {
        let screen_name = format!("wormhole-{name}");
        println!("Opening screen session '{screen_name}'...");
        std::process::Command::new("screen")
            .args(["-S", &screen_name, "claude", "--resume", &driver_session_id])
            .current_dir(&directory)
            .status()
            .context("failed to run screen")?
    } else {
        println!("Attaching to session '{name}' in {}", directory.display());
        std::process::Command::new("claude")
            .args(["--resume", &driver_session_id])
            .current_dir(&directory)
            .status()
            .context("failed to run claude")?
    };

    println!(
        "Claude exited (code {}). Session '{name}' remains active.",
        status.code().unwrap_or(-1)
    );
    Ok(())
}

/// Start the daemon in the background if it is not already serving.
pub async fn ensure_daemon_running() -> anyhow::Result<()> {
    if daemon_is_running().await {
        return Ok(());
    }

    println!("Starting Wormhole daemon in background...");
    let exe = std::env::current_exe().context("cannot determine current executable")?;
    let mut command = tokio::process::Command::new(exe);
    command
        .arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    // Fully detach so the daemon outlives this CLI invocation.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    command.spawn().context("failed to spawn daemon")?;

    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if daemon_is_running().await {
            println!("Daemon started");
            return Ok(());
        }
    }
    bail!("Failed to start daemon")
}

async fn daemon_is_running() -> bool {
    matches!(
        send_request(&socket_path(), &ControlRequest::Status).await,
        ControlResponse::Status { .. }
    )
}

/// Convert pass-through CLI flags into the opaque driver options map:
/// `--model opus --continue` becomes `{"model": "opus", "continue": null}`.
pub fn parse_driver_options(args: &[String]) -> Map<String, Value> {
    let mut options = Map::new();
    let mut i = 0;
    while i < args.len() {
        if let Some(key) = args[i].strip_prefix("--") {
            let key = key.replace('-', "_");
            if i + 1 < args.len() && !args[i + 1].starts_with("--") {
                options.insert(key, Value::String(args[i + 1].clone()));
                i += 2;
            } else {
                options.insert(key, Value::Null);
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags_with_values_and_bare_flags() {
        let options = parse_driver_options(&args(&[
            "--model",
            "opus",
            "--continue",
            "--max-turns",
            "5",
        ]));
        assert_eq!(options["model"], Value::String("opus".into()));
        assert_eq!(options["continue"], Value::Null);
        assert_eq!(options["max_turns"], Value::String("5".into()));
    }

    #[test]
    fn bare_words_are_skipped() {
        let options = parse_driver_options(&args(&["stray", "--plan"]));
        assert_eq!(options.len(), 1);
        assert_eq!(options["plan"], Value::Null);
    }

    #[test]
    fn empty_args_yield_empty_map() {
        assert!(parse_driver_options(&[]).is_empty());
    }
}
