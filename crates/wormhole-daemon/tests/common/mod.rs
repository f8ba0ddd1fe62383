//! Shared test fixtures: an in-memory driver and a ready-made daemon stack.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use wormhole_daemon::broker::PermissionBroker;
use wormhole_daemon::driver::{
    Driver, DriverEvent, DriverFactory, DriverOptions, PermissionGate,
};
use wormhole_daemon::endpoint::DaemonState;
use wormhole_daemon::hub::SubscriptionHub;
use wormhole_daemon::registry::Registry;
use wormhole_shared::protocol::ServerMessage;

/// Handle onto one started test driver: push events, drive the permission
/// gate, and inspect what the session asked of the driver.
#[derive(Clone)]
pub struct TestDriverHandle {
    pub events: mpsc::Sender<DriverEvent>,
    pub gate: Arc<dyn PermissionGate>,
    pub queries: Arc<Mutex<Vec<String>>>,
    pub interrupts: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
}

/// Factory whose drivers do nothing but record calls; tests feed the
/// message stream by hand through the matching [`TestDriverHandle`].
#[derive(Default)]
pub struct TestDriverFactory {
    handles: Mutex<Vec<TestDriverHandle>>,
    pub fail_next_start: AtomicBool,
}

impl TestDriverFactory {
    pub fn handle(&self, index: usize) -> TestDriverHandle {
        self.handles.lock().unwrap()[index].clone()
    }

    pub fn started(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

#[async_trait]
impl DriverFactory for TestDriverFactory {
    async fn start(
        &self,
        _directory: &Path,
        _options: &DriverOptions,
        events: mpsc::Sender<DriverEvent>,
        gate: Arc<dyn PermissionGate>,
    ) -> anyhow::Result<Box<dyn Driver>> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            anyhow::bail!("scripted start failure");
        }
        let queries = Arc::new(Mutex::new(Vec::new()));
        let interrupts = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        self.handles.lock().unwrap().push(TestDriverHandle {
            events,
            gate,
            queries: Arc::clone(&queries),
            interrupts: Arc::clone(&interrupts),
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(TestDriver {
            queries,
            interrupts,
            closed,
        }))
    }
}

struct TestDriver {
    queries: Arc<Mutex<Vec<String>>>,
    interrupts: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Driver for TestDriver {
    async fn query(&self, text: &str) -> anyhow::Result<()> {
        self.queries.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestStack {
    pub broker: Arc<PermissionBroker>,
    pub hub: Arc<SubscriptionHub>,
    pub factory: Arc<TestDriverFactory>,
    pub registry: Arc<Registry>,
}

pub fn test_stack(ring_capacity: usize) -> TestStack {
    let broker = Arc::new(PermissionBroker::new());
    let hub = Arc::new(SubscriptionHub::new(4096));
    let factory = Arc::new(TestDriverFactory::default());
    let registry = Arc::new(Registry::new(
        Arc::clone(&broker),
        Arc::clone(&hub),
        Arc::clone(&factory) as Arc<dyn DriverFactory>,
        ring_capacity,
    ));
    TestStack {
        broker,
        hub,
        factory,
        registry,
    }
}

impl TestStack {
    pub fn daemon_state(&self) -> DaemonState {
        DaemonState {
            registry: Arc::clone(&self.registry),
            hub: Arc::clone(&self.hub),
            broker: Arc::clone(&self.broker),
            machine_name: "testhost".to_string(),
            server_version: "0.1.0".to_string(),
            port: 7117,
        }
    }
}

pub fn init_event(session_id: &str) -> Value {
    json!({"type": "system", "subtype": "init", "session_id": session_id})
}

pub fn result_event(cost: f64) -> Value {
    json!({
        "type": "result",
        "subtype": "success",
        "total_cost_usd": cost,
        "usage": {"input_tokens": 10, "output_tokens": 20},
    })
}

pub async fn recv_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("frame channel closed")
}
