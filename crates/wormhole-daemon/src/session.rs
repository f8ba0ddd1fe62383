//! One live agent session bound to a working directory.
//!
//! A session owns its driver, its event ring, and its slice of the pending
//! permission set. Driver messages are sequenced into the ring and fanned
//! out through the hub; the driver's tool-use callback suspends on the
//! permission broker until a human decision arrives.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use wormhole_shared::protocol::{
    ErrorCode, EventFrame, PermissionDecision, ServerMessage, SessionInfo, SessionState,
};

use crate::broker::PermissionBroker;
use crate::driver::{
    Driver, DriverEvent, DriverFactory, DriverOptions, PermissionGate, PermissionVerdict,
};
use crate::error::DaemonError;
use crate::hub::SubscriptionHub;
use crate::ring::EventRing;

const DRIVER_EVENT_QUEUE: usize = 256;

struct SessionStatus {
    state: SessionState,
    driver_session_id: Option<String>,
    cost_usd: f64,
    last_activity: Option<DateTime<Utc>>,
}

pub struct Session {
    pub name: String,
    pub directory: PathBuf,
    status: Arc<StdMutex<SessionStatus>>,
    ring: StdMutex<EventRing>,
    /// At most one driver call is in flight per session.
    driver: Mutex<Option<Box<dyn Driver>>>,
    broker: Arc<PermissionBroker>,
    hub: Arc<SubscriptionHub>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        name: String,
        directory: PathBuf,
        ring_capacity: usize,
        broker: Arc<PermissionBroker>,
        hub: Arc<SubscriptionHub>,
    ) -> Self {
        Self {
            name,
            directory,
            status: Arc::new(StdMutex::new(SessionStatus {
                state: SessionState::Idle,
                driver_session_id: None,
                cost_usd: 0.0,
                last_activity: None,
            })),
            ring: StdMutex::new(EventRing::new(ring_capacity)),
            driver: Mutex::new(None),
            broker,
            hub,
        }
    }

    /// Start the driver and the event intake task.
    pub async fn start(
        self: &Arc<Self>,
        factory: &dyn DriverFactory,
        options: &DriverOptions,
    ) -> anyhow::Result<()> {
        let (events_tx, events_rx) = mpsc::channel(DRIVER_EVENT_QUEUE);
        let gate = Arc::new(SessionGate {
            session_name: self.name.clone(),
            status: Arc::clone(&self.status),
            broker: Arc::clone(&self.broker),
            hub: Arc::clone(&self.hub),
        });
        let driver = factory
            .start(&self.directory, options, events_tx, gate)
            .await?;
        *self.driver.lock().await = Some(driver);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.intake(events_rx).await;
        });
        Ok(())
    }

    async fn intake(self: Arc<Self>, mut events: mpsc::Receiver<DriverEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::Message(message) => self.ingest(message),
                DriverEvent::Fatal(reason) => {
                    self.fail(&reason);
                    break;
                }
            }
        }
    }

    /// Wrap one driver message in an event, sequence it, and fan it out.
    fn ingest(&self, message: Value) {
        let msg_type = message.get("type").and_then(Value::as_str).map(String::from);
        let subtype = message
            .get("subtype")
            .and_then(Value::as_str)
            .map(String::from);
        let init_session_id = message
            .get("session_id")
            .and_then(Value::as_str)
            .or_else(|| message.pointer("/data/session_id").and_then(Value::as_str))
            .map(String::from);
        let result_cost = message.get("total_cost_usd").and_then(Value::as_f64);

        let record = self.ring.lock().unwrap().append(message);

        {
            let mut st = self.status.lock().unwrap();
            st.last_activity = Some(record.timestamp);
            if msg_type.as_deref() == Some("system") && subtype.as_deref() == Some("init") {
                if let Some(id) = init_session_id {
                    debug!(session = %self.name, driver_session_id = %id, "driver initialized");
                    st.driver_session_id = Some(id);
                }
            }
            if msg_type.as_deref() == Some("result") {
                if let Some(cost) = result_cost {
                    if cost.is_finite() && cost > 0.0 {
                        st.cost_usd += cost;
                    }
                }
                if st.state == SessionState::Working {
                    st.state = SessionState::Idle;
                }
            }
        }

        self.hub.broadcast(
            &self.name,
            &ServerMessage::Event(EventFrame {
                session: self.name.clone(),
                sequence: record.sequence,
                timestamp: record.timestamp,
                message: record.message,
            }),
        );
    }

    /// Fatal driver failure: mark the session errored, deny outstanding
    /// permissions, and surface the failure both as a sequenced event and
    /// as an error frame to subscribers.
    fn fail(&self, reason: &str) {
        warn!(
            session = %self.name,
            code = ErrorCode::DriverError.as_str(),
            "driver failed: {reason}"
        );
        {
            let mut st = self.status.lock().unwrap();
            st.state = SessionState::Error;
        }
        let record = self
            .ring
            .lock()
            .unwrap()
            .append(json!({"type": "error", "error": reason}));
        self.hub.broadcast(
            &self.name,
            &ServerMessage::Event(EventFrame {
                session: self.name.clone(),
                sequence: record.sequence,
                timestamp: record.timestamp,
                message: record.message,
            }),
        );
        let denied = self.broker.fail_all(&self.name);
        if denied > 0 {
            info!(session = %self.name, denied, "denied pending permissions after driver failure");
        }
        self.hub.broadcast(
            &self.name,
            &ServerMessage::session_error(
                ErrorCode::DriverError,
                format!("Session error: {reason}"),
                self.name.as_str(),
            ),
        );
    }

    /// Submit a user turn (or a synthetic one like `/compact`).
    pub async fn query(&self, text: &str) -> Result<(), DaemonError> {
        {
            let mut st = self.status.lock().unwrap();
            if st.state == SessionState::Error {
                return Err(DaemonError::Driver(format!(
                    "Session '{}' has failed; close it to recover",
                    self.name
                )));
            }
            // A turn submitted while a permission is pending is buffered by
            // the driver; the session stays gated until the decision lands.
            if st.state == SessionState::Idle {
                st.state = SessionState::Working;
            }
            st.last_activity = Some(Utc::now());
        }
        let driver = self.driver.lock().await;
        let driver = driver
            .as_deref()
            .ok_or_else(|| DaemonError::Driver(format!("Session '{}' has no driver", self.name)))?;
        driver
            .query(text)
            .await
            .map_err(|e| DaemonError::Driver(e.to_string()))
    }

    /// Cancel the current turn. Safe from any state; a no-op when idle.
    pub async fn interrupt(&self) -> Result<(), DaemonError> {
        let driver = self.driver.lock().await;
        match driver.as_deref() {
            Some(driver) => driver
                .interrupt()
                .await
                .map_err(|e| DaemonError::Driver(e.to_string())),
            None => Ok(()),
        }
    }

    /// Tear down the driver and deny whatever was still pending.
    pub async fn shutdown(&self) {
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.close().await {
                warn!(session = %self.name, error = %e, "driver close failed");
            }
        }
        let denied = self.broker.fail_all(&self.name);
        info!(session = %self.name, denied, "session shut down");
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().unwrap().state
    }

    pub fn driver_session_id(&self) -> Option<String> {
        self.status.lock().unwrap().driver_session_id.clone()
    }

    pub fn cost_usd(&self) -> f64 {
        self.status.lock().unwrap().cost_usd
    }

    /// Events after `last_seen`, plus the truncation flag for catch-up.
    pub fn events_after(&self, last_seen: u64) -> (Vec<EventFrame>, bool) {
        let (events, truncated) = self.ring.lock().unwrap().events_after(last_seen);
        let frames = events
            .into_iter()
            .map(|e| EventFrame {
                session: self.name.clone(),
                sequence: e.sequence,
                timestamp: e.timestamp,
                message: e.message,
            })
            .collect();
        (frames, truncated)
    }

    pub fn ring_range(&self) -> Option<(u64, u64)> {
        self.ring.lock().unwrap().range()
    }

    pub fn snapshot(&self) -> SessionInfo {
        let st = self.status.lock().unwrap();
        SessionInfo {
            name: self.name.clone(),
            directory: self.directory.to_string_lossy().into_owned(),
            state: st.state,
            claude_session_id: st.driver_session_id.clone(),
            cost_usd: st.cost_usd,
            last_activity: st.last_activity,
            pending_permissions: self.broker.pending_for(&self.name),
        }
    }
}

/// The session side of the driver's permission callback.
///
/// `request` publishes the pending permission and broadcasts the
/// `permission_request` frame before returning, so the request is already
/// resolvable when the returned future starts waiting.
struct SessionGate {
    session_name: String,
    status: Arc<StdMutex<SessionStatus>>,
    broker: Arc<PermissionBroker>,
    hub: Arc<SubscriptionHub>,
}

impl PermissionGate for SessionGate {
    fn request(&self, tool_name: &str, tool_input: Value) -> BoxFuture<'static, PermissionVerdict> {
        let (request_id, waiter) =
            self.broker
                .open(&self.session_name, tool_name, tool_input.clone());
        {
            let mut st = self.status.lock().unwrap();
            if st.state != SessionState::Error {
                st.state = SessionState::AwaitingApproval;
            }
            st.last_activity = Some(Utc::now());
        }
        debug!(
            session = %self.session_name,
            request_id = %request_id,
            tool_name,
            "permission requested"
        );
        self.hub.broadcast(
            &self.session_name,
            &ServerMessage::PermissionRequest {
                request_id,
                tool_name: tool_name.to_string(),
                tool_input: tool_input.clone(),
                session_name: self.session_name.clone(),
            },
        );

        let status = Arc::clone(&self.status);
        let broker = Arc::clone(&self.broker);
        let session_name = self.session_name.clone();
        Box::pin(async move {
            // A dropped waiter can only mean teardown; treat it as deny.
            let decision = waiter.await.unwrap_or(PermissionDecision::Deny);
            {
                let mut st = status.lock().unwrap();
                if st.state == SessionState::AwaitingApproval && !broker.has_pending(&session_name)
                {
                    st.state = SessionState::Working;
                }
            }
            match decision {
                PermissionDecision::Allow => PermissionVerdict::Allow {
                    updated_input: tool_input,
                },
                PermissionDecision::Deny => PermissionVerdict::Deny {
                    message: "User denied".to_string(),
                    interrupt: false,
                },
            }
        })
    }
}
