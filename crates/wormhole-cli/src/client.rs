//! Control-socket client: one NDJSON request/response per call.

use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use wormhole_shared::control::{ControlRequest, ControlResponse};

/// Send one request to the daemon. Transport failures come back as error
/// responses so callers handle a single shape.
pub async fn send_request(path: &Path, request: &ControlRequest) -> ControlResponse {
    if !path.exists() {
        return daemon_not_running();
    }
    match try_send(path, request).await {
        Ok(response) => response,
        Err(e) => {
            let refused = e
                .downcast_ref::<std::io::Error>()
                .map(|io| io.kind() == std::io::ErrorKind::ConnectionRefused)
                .unwrap_or(false);
            if refused {
                daemon_not_running()
            } else {
                ControlResponse::error("CONNECTION_ERROR", format!("Failed to contact daemon: {e}"))
            }
        }
    }
}

fn daemon_not_running() -> ControlResponse {
    ControlResponse::error(
        "DAEMON_NOT_RUNNING",
        "Wormhole daemon is not running. Start it with: wormhole daemon",
    )
}

async fn try_send(path: &Path, request: &ControlRequest) -> anyhow::Result<ControlResponse> {
    let stream = UnixStream::connect(path).await?;
    let (reader, mut writer) = stream.into_split();

    let mut json = serde_json::to_string(request)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    let line = lines
        .next_line()
        .await?
        .context("daemon closed the connection without responding")?;
    Ok(serde_json::from_str(&line)?)
}
