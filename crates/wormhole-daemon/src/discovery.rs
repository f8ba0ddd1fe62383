//! DNS-SD advertisement so clients can find the daemon on the local
//! network without configuration.
//!
//! Best-effort by contract: a machine without a working mDNS stack still
//! serves connections, it just is not discoverable.

use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_wormhole._tcp.local.";

pub struct DiscoveryAdvertiser {
    port: u16,
    machine_name: String,
    daemon: Option<ServiceDaemon>,
    fullname: Option<String>,
}

impl DiscoveryAdvertiser {
    pub fn new(port: u16, machine_name: String) -> Self {
        Self {
            port,
            machine_name,
            daemon: None,
            fullname: None,
        }
    }

    /// Register `_wormhole._tcp` under the machine's hostname. Addresses
    /// are resolved automatically per interface.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.daemon.is_some() {
            return Ok(());
        }
        let mdns = ServiceDaemon::new()?;
        let host = format!("{}.local.", self.machine_name);
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &self.machine_name,
            &host,
            "",
            self.port,
            HashMap::<String, String>::new(),
        )?
        .enable_addr_auto();
        let fullname = service.get_fullname().to_string();
        mdns.register(service)?;
        info!(
            service = %fullname,
            port = self.port,
            "discovery advertisement started"
        );
        self.daemon = Some(mdns);
        self.fullname = Some(fullname);
        Ok(())
    }

    /// Unregister and shut the responder down. Errors are logged, not
    /// propagated: shutdown must proceed regardless.
    pub fn stop(&mut self) {
        let (Some(daemon), Some(fullname)) = (self.daemon.take(), self.fullname.take()) else {
            return;
        };
        if let Err(e) = daemon.unregister(&fullname) {
            warn!(error = %e, "failed to unregister discovery service");
        }
        if let Err(e) = daemon.shutdown() {
            debug!(error = %e, "mdns responder shutdown error");
        }
        info!("discovery advertisement stopped");
    }

    pub fn is_running(&self) -> bool {
        self.daemon.is_some()
    }
}

impl Drop for DiscoveryAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}
