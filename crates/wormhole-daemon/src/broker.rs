//! Permission broker: correlates outbound permission requests with inbound
//! decisions.
//!
//! Each pending request holds a one-shot slot that completes exactly once.
//! Allocation and resolution both run under the broker lock, so a decision
//! that arrives immediately after `open` publishes the request is still
//! honored. Resolving an unknown or already-resolved request is an error,
//! never a silent drop.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;
use wormhole_shared::protocol::{PendingPermissionInfo, PermissionDecision};

#[derive(Debug, Error)]
#[error("unknown permission request: {request_id}")]
pub struct UnknownRequest {
    pub request_id: String,
}

struct PendingEntry {
    info: PendingPermissionInfo,
    slot: oneshot::Sender<PermissionDecision>,
}

#[derive(Default)]
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a pending permission for `session` and return its id plus
    /// the waiter that yields the decision.
    pub fn open(
        &self,
        session: &str,
        tool_name: &str,
        tool_input: Value,
    ) -> (String, oneshot::Receiver<PermissionDecision>) {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let info = PendingPermissionInfo {
            request_id: request_id.clone(),
            tool_name: tool_name.to_string(),
            tool_input,
            session_name: session.to_string(),
            created_at: Utc::now(),
        };
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), PendingEntry { info, slot: tx });
        (request_id, rx)
    }

    /// Complete the matching waiter. The entry is removed before the slot
    /// fires, so the session's pending set is already clean when the driver
    /// callback resumes. Duplicate resolutions find no entry.
    pub fn resolve(
        &self,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), UnknownRequest> {
        let entry = self.pending.lock().unwrap().remove(request_id);
        match entry {
            Some(entry) => {
                // A dropped waiter means the session died mid-decision;
                // nothing left to notify.
                let _ = entry.slot.send(decision);
                Ok(())
            }
            None => Err(UnknownRequest {
                request_id: request_id.to_string(),
            }),
        }
    }

    /// Deny every pending request belonging to `session`. Used on session
    /// teardown and on fatal driver failure. Returns how many were denied.
    pub fn fail_all(&self, session: &str) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.info.session_name == session)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        let n = drained.len();
        for entry in drained {
            let _ = entry.slot.send(PermissionDecision::Deny);
        }
        n
    }

    /// Pending requests for one session, oldest first.
    pub fn pending_for(&self, session: &str) -> Vec<PendingPermissionInfo> {
        let pending = self.pending.lock().unwrap();
        let mut infos: Vec<PendingPermissionInfo> = pending
            .values()
            .filter(|e| e.info.session_name == session)
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    pub fn has_pending(&self, session: &str) -> bool {
        self.pending
            .lock()
            .unwrap()
            .values()
            .any(|e| e.info.session_name == session)
    }
}
