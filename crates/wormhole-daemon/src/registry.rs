//! Global session table, keyed independently by name and by directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::broker::PermissionBroker;
use crate::driver::{DriverFactory, DriverOptions};
use crate::error::DaemonError;
use crate::hub::SubscriptionHub;
use crate::session::Session;

#[derive(Default)]
struct Tables {
    by_name: HashMap<String, Arc<Session>>,
    by_directory: HashMap<PathBuf, String>,
}

pub struct Registry {
    tables: Mutex<Tables>,
    broker: Arc<PermissionBroker>,
    hub: Arc<SubscriptionHub>,
    factory: Arc<dyn DriverFactory>,
    ring_capacity: usize,
}

impl Registry {
    pub fn new(
        broker: Arc<PermissionBroker>,
        hub: Arc<SubscriptionHub>,
        factory: Arc<dyn DriverFactory>,
        ring_capacity: usize,
    ) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            broker,
            hub,
            factory,
            ring_capacity,
        }
    }

    /// Create and start a session. Fails with `SESSION_EXISTS` if the name
    /// or the directory is already taken; the table slots are reserved
    /// before the driver spawns, so a conflicting call can never leave a
    /// partially initialized driver behind.
    pub async fn open(
        &self,
        name: Option<String>,
        directory: impl AsRef<Path>,
        options: DriverOptions,
    ) -> Result<Arc<Session>, DaemonError> {
        let directory = std::path::absolute(directory.as_ref())
            .map_err(|e| DaemonError::InvalidMessage(format!("invalid directory: {e}")))?;
        let name = name.unwrap_or_else(|| generate_session_name(&directory));

        let session = {
            let mut tables = self.tables.lock().unwrap();
            if let Some(existing) = tables.by_directory.get(&directory) {
                return Err(DaemonError::SessionExists(format!(
                    "A session already exists in this directory: {existing}"
                )));
            }
            if tables.by_name.contains_key(&name) {
                return Err(DaemonError::SessionExists(format!(
                    "A session named '{name}' already exists"
                )));
            }
            let session = Arc::new(Session::new(
                name.clone(),
                directory.clone(),
                self.ring_capacity,
                Arc::clone(&self.broker),
                Arc::clone(&self.hub),
            ));
            tables.by_name.insert(name.clone(), Arc::clone(&session));
            tables.by_directory.insert(directory.clone(), name.clone());
            session
        };

        if let Err(e) = session.start(self.factory.as_ref(), &options).await {
            let mut tables = self.tables.lock().unwrap();
            tables.by_name.remove(&name);
            tables.by_directory.remove(&directory);
            return Err(DaemonError::Driver(e.to_string()));
        }

        info!(session = %name, directory = %directory.display(), "session opened");
        Ok(session)
    }

    /// Tear down a session and release both table slots.
    pub async fn close(&self, name: &str) -> Result<(), DaemonError> {
        let session = {
            let mut tables = self.tables.lock().unwrap();
            let session = tables
                .by_name
                .remove(name)
                .ok_or_else(|| DaemonError::SessionNotFound(name.to_string()))?;
            tables.by_directory.remove(&session.directory);
            session
        };
        session.shutdown().await;
        info!(session = %name, "session closed");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.tables.lock().unwrap().by_name.get(name).cloned()
    }

    /// Snapshot of all sessions, in name order.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let tables = self.tables.lock().unwrap();
        let mut sessions: Vec<Arc<Session>> = tables.by_name.values().cloned().collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    pub fn count(&self) -> usize {
        self.tables.lock().unwrap().by_name.len()
    }

    /// Close every session. Used during daemon shutdown.
    pub async fn close_all(&self) {
        let names: Vec<String> = {
            let tables = self.tables.lock().unwrap();
            tables.by_name.keys().cloned().collect()
        };
        for name in names {
            let _ = self.close(&name).await;
        }
    }
}

/// `<basename(dir)>-<4 hex>`, with the suffix derived from the full path so
/// same-named directories in different places get distinct defaults.
pub fn generate_session_name(directory: &Path) -> String {
    let base = directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string());
    let digest = Sha256::digest(directory.to_string_lossy().as_bytes());
    let suffix: String = digest.iter().take(2).map(|b| format!("{b:02x}")).collect();
    format!("{base}-{suffix}")
}
