//! Local control socket: the CLI's RPC surface.
//!
//! Newline-delimited JSON over a Unix domain socket, owner-only by file
//! mode. This never leaves the machine; filesystem permissions are the
//! authentication.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use wormhole_shared::control::{ControlRequest, ControlResponse};
use wormhole_shared::protocol::ErrorCode;

use crate::driver::DriverOptions;
use crate::endpoint::DaemonState;

/// Bind the control socket, replacing any stale file from a previous run.
/// A failure here is fatal to the daemon.
pub fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

pub async fn serve(
    listener: UnixListener,
    path: PathBuf,
    state: DaemonState,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(path = %path.display(), "control socket listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state).await {
                            debug!("control connection ended: {e}");
                        }
                    });
                }
                Err(e) => warn!("control socket accept error: {e}"),
            },
            _ = shutdown.wait_for(|&stopping| stopping) => break,
        }
    }
    let _ = std::fs::remove_file(&path);
    info!("control socket closed");
}

async fn handle_connection(stream: UnixStream, state: DaemonState) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(line) {
            Ok(request) => handle_request(&state, request).await,
            Err(e) => ControlResponse::error(
                ErrorCode::InvalidMessage.as_str(),
                format!("invalid control request: {e}"),
            ),
        };
        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

pub async fn handle_request(state: &DaemonState, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Open {
            name,
            directory,
            options,
        } => {
            let options: DriverOptions = match options {
                Some(Value::Object(map)) => map,
                None => DriverOptions::new(),
                Some(_) => {
                    return ControlResponse::error(
                        ErrorCode::InvalidMessage.as_str(),
                        "options must be an object",
                    );
                }
            };
            match state.registry.open(name, Path::new(&directory), options).await {
                Ok(session) => ControlResponse::Open {
                    name: session.name.clone(),
                },
                Err(e) => ControlResponse::error(e.code().as_str(), e.to_string()),
            }
        }

        ControlRequest::Close { name } => match state.registry.close(&name).await {
            Ok(()) => ControlResponse::Empty {},
            Err(e) => ControlResponse::error(e.code().as_str(), e.to_string()),
        },

        ControlRequest::List => ControlResponse::List {
            sessions: state.registry.list().iter().map(|s| s.snapshot()).collect(),
        },

        ControlRequest::Status => ControlResponse::Status {
            port: state.port,
            pid: std::process::id(),
            version: state.server_version.clone(),
            sessions: state.registry.count(),
            clients: state.hub.client_count(),
        },

        ControlRequest::ResolveAttach { name } => match state.registry.get(&name) {
            None => ControlResponse::error(
                ErrorCode::SessionNotFound.as_str(),
                format!("Session not found: {name}"),
            ),
            Some(session) => match session.driver_session_id() {
                Some(driver_session_id) => ControlResponse::ResolveAttach { driver_session_id },
                None => ControlResponse::error(
                    ErrorCode::DriverError.as_str(),
                    format!("Session '{name}' has no driver session id yet; send a query first"),
                ),
            },
        },
    }
}
