//! Subscription hub: tracks what each client watches and fans out frames.
//!
//! Every frame destined for a client flows through that client's single
//! bounded queue, which is what guarantees per-client ordering. A slow
//! client fills its own queue and gets disconnected with a `BACKPRESSURE`
//! error; it never stalls a session or another client.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use wormhole_shared::protocol::{ErrorCode, ServerMessage, SubscribeTarget};

use crate::error::DaemonError;

/// Per-client outbound queue high-water mark.
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 4096;

/// What a client has subscribed to. The wildcard covers sessions opened
/// after the subscription was made.
#[derive(Debug, Clone)]
pub enum Subscription {
    None,
    All,
    Named(HashSet<String>),
}

impl Subscription {
    pub fn covers(&self, session: &str) -> bool {
        match self {
            Subscription::None => false,
            Subscription::All => true,
            Subscription::Named(names) => names.contains(session),
        }
    }
}

/// Receiving ends handed to the endpoint's outbound pump. `kill` fires at
/// most once, carrying the final error frame to deliver before closing.
pub struct ClientQueues {
    pub frames: mpsc::Receiver<ServerMessage>,
    pub kill: oneshot::Receiver<ServerMessage>,
}

struct ClientEntry {
    device_name: String,
    frames: mpsc::Sender<ServerMessage>,
    kill: Option<oneshot::Sender<ServerMessage>>,
    subscription: Subscription,
}

pub struct SubscriptionHub {
    clients: Mutex<HashMap<String, ClientEntry>>,
    queue_capacity: usize,
}

impl SubscriptionHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn register(&self, client_id: &str, device_name: &str) -> ClientQueues {
        let (frames_tx, frames_rx) = mpsc::channel(self.queue_capacity);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.clients.lock().unwrap().insert(
            client_id.to_string(),
            ClientEntry {
                device_name: device_name.to_string(),
                frames: frames_tx,
                kill: Some(kill_tx),
                subscription: Subscription::None,
            },
        );
        debug!(client_id, device_name, "client registered");
        ClientQueues {
            frames: frames_rx,
            kill: kill_rx,
        }
    }

    pub fn unregister(&self, client_id: &str) {
        if self.clients.lock().unwrap().remove(client_id).is_some() {
            debug!(client_id, "client unregistered");
        }
    }

    pub fn subscribe(&self, client_id: &str, target: &SubscribeTarget) -> Result<(), DaemonError> {
        let mut clients = self.clients.lock().unwrap();
        let entry = clients
            .get_mut(client_id)
            .ok_or_else(|| DaemonError::InvalidMessage("unknown client".to_string()))?;
        match target {
            SubscribeTarget::Wildcard(w) if w == "*" => {
                entry.subscription = Subscription::All;
            }
            SubscribeTarget::Wildcard(other) => {
                return Err(DaemonError::InvalidMessage(format!(
                    "invalid subscription target: {other:?}"
                )));
            }
            SubscribeTarget::Sessions(names) => match &mut entry.subscription {
                Subscription::All => {}
                Subscription::Named(existing) => {
                    existing.extend(names.iter().cloned());
                }
                sub @ Subscription::None => {
                    *sub = Subscription::Named(names.iter().cloned().collect());
                }
            },
        }
        Ok(())
    }

    pub fn is_subscribed(&self, client_id: &str, session: &str) -> bool {
        self.clients
            .lock()
            .unwrap()
            .get(client_id)
            .map(|e| e.subscription.covers(session))
            .unwrap_or(false)
    }

    /// Queue a frame for one client. On overflow the client is dropped with
    /// a `BACKPRESSURE` error frame.
    pub fn send_to(&self, client_id: &str, frame: ServerMessage) {
        let mut clients = self.clients.lock().unwrap();
        Self::deliver(&mut clients, client_id, frame);
    }

    /// Queue a frame for every client subscribed to `session`.
    pub fn broadcast(&self, session: &str, frame: &ServerMessage) {
        let mut clients = self.clients.lock().unwrap();
        let targets: Vec<String> = clients
            .iter()
            .filter(|(_, e)| e.subscription.covers(session))
            .map(|(id, _)| id.clone())
            .collect();
        for id in targets {
            Self::deliver(&mut clients, &id, frame.clone());
        }
    }

    fn deliver(clients: &mut HashMap<String, ClientEntry>, client_id: &str, frame: ServerMessage) {
        let Some(entry) = clients.get_mut(client_id) else {
            return;
        };
        match entry.frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    client_id,
                    device_name = %entry.device_name,
                    code = ErrorCode::Backpressure.as_str(),
                    "client outbound queue overflow, dropping client"
                );
                if let Some(kill) = entry.kill.take() {
                    let _ = kill.send(ServerMessage::error(
                        ErrorCode::Backpressure,
                        "client outbound queue overflow",
                    ));
                }
                clients.remove(client_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                clients.remove(client_id);
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}
