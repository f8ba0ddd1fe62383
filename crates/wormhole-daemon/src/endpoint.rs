//! WebSocket client endpoint: handshake, dispatch, outbound pump.
//!
//! Endpoints refer to sessions by name and look them up in the registry on
//! every frame, so a closed session is observed rather than dangled. All
//! frames for a client leave through its hub queue; the pump task here is
//! the only writer to the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;
use wormhole_shared::protocol::{ClientMessage, ControlAction, ErrorCode, ServerMessage};

use crate::broker::PermissionBroker;
use crate::error::DaemonError;
use crate::hub::SubscriptionHub;
use crate::registry::Registry;

/// Shared handles for the WebSocket and control-plane surfaces.
#[derive(Clone)]
pub struct DaemonState {
    pub registry: Arc<Registry>,
    pub hub: Arc<SubscriptionHub>,
    pub broker: Arc<PermissionBroker>,
    pub machine_name: String,
    pub server_version: String,
    pub port: u16,
}

pub fn router(state: DaemonState) -> Router {
    Router::new().route("/", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(State(state): State<DaemonState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn text_frame(msg: &ServerMessage) -> Message {
    Message::Text(serde_json::to_string(msg).unwrap_or_default().into())
}

async fn handle_socket(socket: WebSocket, state: DaemonState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The first frame must be `hello`; anything else is a protocol error.
    let device_name = loop {
        let Some(Ok(msg)) = ws_rx.next().await else {
            return;
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Hello {
                    client_version,
                    device_name,
                }) => {
                    debug!(%client_version, %device_name, "client connected");
                    break device_name;
                }
                _ => {
                    return reject_handshake(&mut ws_tx).await;
                }
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return,
            _ => {
                return reject_handshake(&mut ws_tx).await;
            }
        }
    };

    let client_id = Uuid::new_v4().to_string();
    let queues = state.hub.register(&client_id, &device_name);

    let welcome = ServerMessage::Welcome {
        server_version: state.server_version.clone(),
        machine_name: state.machine_name.clone(),
        sessions: state.registry.list().iter().map(|s| s.snapshot()).collect(),
    };
    state.hub.send_to(&client_id, welcome);

    // Outbound pump: the kill slot delivers one final error frame (for
    // instance BACKPRESSURE) before the connection is closed.
    let pump_client_id = client_id.clone();
    let crate::hub::ClientQueues {
        mut frames,
        mut kill,
    } = queues;
    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                last = &mut kill => {
                    if let Ok(frame) = last {
                        let _ = ws_tx.send(text_frame(&frame)).await;
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_tx.send(text_frame(&frame)).await {
                                debug!(client_id = %pump_client_id, error = %e, "send failed, closing pump");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    if let Some(reply) = dispatch(&state, &client_id, msg).await {
                        state.hub.send_to(&client_id, reply);
                    }
                }
                Err(e) => {
                    state.hub.send_to(
                        &client_id,
                        ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()),
                    );
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                state.hub.send_to(
                    &client_id,
                    ServerMessage::error(ErrorCode::InvalidMessage, "expected a text frame"),
                );
            }
        }
    }

    debug!(%client_id, %device_name, "client disconnected");
    state.hub.unregister(&client_id);
    pump.abort();
}

async fn reject_handshake(ws_tx: &mut SplitSink<WebSocket, Message>) {
    let frame = ServerMessage::error(ErrorCode::WebsocketError, "handshake must begin with hello");
    if let Err(e) = ws_tx.send(text_frame(&frame)).await {
        warn!(error = %e, "failed to send handshake rejection");
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Route one parsed frame. Returns a direct reply for the sender's own
/// queue, or `None` when the effect is broadcast (or there is none).
async fn dispatch(
    state: &DaemonState,
    client_id: &str,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Hello { .. } => Some(ServerMessage::error(
            ErrorCode::InvalidMessage,
            "unexpected hello after handshake",
        )),

        ClientMessage::Subscribe { sessions } => {
            match state.hub.subscribe(client_id, &sessions) {
                Ok(()) => None,
                Err(e) => Some(e.to_frame(None)),
            }
        }

        ClientMessage::Input { session, text } => {
            let Some(target) = state.registry.get(&session) else {
                return Some(DaemonError::SessionNotFound(session.clone()).to_frame(Some(&session)));
            };
            match target.query(&text).await {
                Ok(()) => None,
                Err(e) => Some(e.to_frame(Some(&session))),
            }
        }

        ClientMessage::PermissionResponse {
            request_id,
            decision,
        } => match state.broker.resolve(&request_id, decision) {
            Ok(()) => None,
            Err(e) => Some(ServerMessage::error(
                ErrorCode::InvalidMessage,
                e.to_string(),
            )),
        },

        ClientMessage::Control { session, action } => {
            let Some(target) = state.registry.get(&session) else {
                return Some(DaemonError::SessionNotFound(session.clone()).to_frame(Some(&session)));
            };
            let result = match action {
                ControlAction::Interrupt => target.interrupt().await,
                ControlAction::Compact => target.query("/compact").await,
                // History in the ring is kept for replay; only the driver
                // forgets its conversation.
                ControlAction::Clear => target.query("/clear").await,
                ControlAction::Plan => target.query("/plan").await,
            };
            match result {
                Ok(()) => None,
                Err(e) => Some(e.to_frame(Some(&session))),
            }
        }

        ClientMessage::Sync {
            session,
            last_seen_sequence,
        } => {
            let Some(target) = state.registry.get(&session) else {
                return Some(DaemonError::SessionNotFound(session.clone()).to_frame(Some(&session)));
            };
            if !state.hub.is_subscribed(client_id, &session) {
                return Some(DaemonError::NotSubscribed(session.clone()).to_frame(Some(&session)));
            }
            let (events, truncated) = target.events_after(last_seen_sequence);
            Some(ServerMessage::SyncResponse {
                session: session.clone(),
                events,
                truncated,
                pending_permissions: state.broker.pending_for(&session),
            })
        }
    }
}
