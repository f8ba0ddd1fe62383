//! The Wormhole daemon: a concurrent multi-session coordinator.
//!
//! One daemon per machine owns a pool of agent driver processes (one per
//! working directory), gates their tool use on human decisions delivered
//! over WebSocket, and fans each session's event stream out to however
//! many clients are watching.

pub mod broker;
pub mod config;
pub mod control;
pub mod discovery;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod hub;
pub mod machine;
pub mod registry;
pub mod ring;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use broker::PermissionBroker;
use config::Config;
use discovery::DiscoveryAdvertiser;
use driver::claude::ClaudeDriverFactory;
use driver::DriverFactory;
use endpoint::DaemonState;
use hub::SubscriptionHub;
use registry::Registry;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let factory: Arc<dyn DriverFactory> = Arc::new(ClaudeDriverFactory::default());
    run_daemon_with_factory(config, factory).await
}

/// Run the daemon with a specific driver factory. The singleton resources
/// (registry, advertiser, listener, control socket) are acquired here and
/// released in reverse order on shutdown.
pub async fn run_daemon_with_factory(
    config: Config,
    factory: Arc<dyn DriverFactory>,
) -> anyhow::Result<()> {
    let broker = Arc::new(PermissionBroker::new());
    let hub = Arc::new(SubscriptionHub::new(hub::DEFAULT_CLIENT_QUEUE_CAPACITY));
    let registry = Arc::new(Registry::new(
        Arc::clone(&broker),
        Arc::clone(&hub),
        factory,
        config.buffer_size,
    ));
    let machine_name = machine::short_hostname();

    let state = DaemonState {
        registry: Arc::clone(&registry),
        hub: Arc::clone(&hub),
        broker,
        machine_name: machine_name.clone(),
        server_version: SERVER_VERSION.to_string(),
        port: config.port,
    };

    // Control socket and listen port are fatal; everything after is not.
    let socket_path = wormhole_shared::control::socket_path();
    let control_listener = control::bind(&socket_path)?;
    let (control_shutdown_tx, control_shutdown_rx) = watch::channel(false);
    let control_task = tokio::spawn(control::serve(
        control_listener,
        socket_path.clone(),
        state.clone(),
        control_shutdown_rx,
    ));

    let mut advertiser = DiscoveryAdvertiser::new(config.port, machine_name.clone());
    if config.discovery_enabled {
        if let Err(e) = advertiser.start() {
            warn!(error = %e, "discovery advertisement failed; continuing without it");
        }
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(
        port = config.port,
        machine = %machine_name,
        control_socket = %socket_path.display(),
        "wormhole daemon ready"
    );

    let app = endpoint::router(state);
    let shutdown_notify = Arc::new(Notify::new());
    let notify_for_server = Arc::clone(&shutdown_notify);
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                notify_for_server.notified().await;
            })
            .await
    });

    shutdown_signal().await;

    // Teardown order: sessions first (drivers cancelled, pending
    // permissions denied), then discovery unregister, control socket,
    // and finally the WebSocket endpoints.
    registry.close_all().await;
    advertiser.stop();
    let _ = control_shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), control_task).await;
    shutdown_notify.notify_one();
    if tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .is_err()
    {
        info!("graceful shutdown timed out, forcing exit");
    }

    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
