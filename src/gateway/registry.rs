//! Client registry: the process-wide map of live client handles.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wagate_core::protocol::{DeviceHandle, ProtocolClient};
use wagate_core::session::{QrInfo, SessionStatus};

/// Mutable view of a live session, cached for fast reads.
#[derive(Debug, Clone)]
pub(crate) struct HandleState {
    pub status: SessionStatus,
    pub qr: Option<(String, DateTime<Utc>)>,
    pub qr_loop_active: bool,
}

/// One live protocol connection and everything needed to tear it down.
pub(crate) struct ClientHandle {
    pub session_id: String,
    pub client: Arc<dyn ProtocolClient>,
    pub device: DeviceHandle,
    /// Stops the supervisor and QR loop of this handle.
    pub cancel: CancellationToken,
    state: Mutex<HandleState>,
}

impl ClientHandle {
    pub fn new(
        session_id: &str,
        client: Arc<dyn ProtocolClient>,
        device: DeviceHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            client,
            device,
            cancel,
            state: Mutex::new(HandleState {
                status: SessionStatus::Created,
                qr: None,
                qr_loop_active: false,
            }),
        }
    }

    pub fn snapshot(&self) -> HandleState {
        self.state.lock().clone()
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.state.lock().status = status;
    }

    pub fn set_qr(&self, code: &str, expires_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.qr = Some((code.to_string(), expires_at));
        state.status = SessionStatus::Connecting;
    }

    pub fn clear_qr(&self) {
        self.state.lock().qr = None;
    }

    /// Drop the cached QR if it is expired at `now`. Returns `true` if cleared.
    pub fn clear_expired_qr(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        match &state.qr {
            Some((_, expires_at)) if *expires_at <= now => {
                state.qr = None;
                true
            }
            _ => false,
        }
    }

    /// Cached QR, whether or not it is still valid.
    pub fn qr(&self) -> Option<(String, DateTime<Utc>)> {
        self.state.lock().qr.clone()
    }

    pub fn qr_at(&self, now: DateTime<Utc>) -> Option<QrInfo> {
        match self.qr() {
            Some((code, expires_at)) if expires_at > now => Some(QrInfo {
                code,
                expires_at,
                timeout_seconds: (expires_at - now).num_seconds().max(0),
            }),
            _ => None,
        }
    }

    pub fn qr_loop_active(&self) -> bool {
        self.state.lock().qr_loop_active
    }

    pub fn set_qr_loop_active(&self, active: bool) {
        self.state.lock().qr_loop_active = active;
    }

    /// Stop the protocol connection and every task of this handle.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.client.disconnect().await;
    }
}

/// `id → ClientHandle`. Removing an entry is the single release point.
#[derive(Default)]
pub(crate) struct Registry {
    handles: RwLock<HashMap<String, Arc<ClientHandle>>>,
}

impl Registry {
    /// Register a fully built handle. A handle already registered under the
    /// same id is cancelled and returned.
    pub async fn put(&self, handle: Arc<ClientHandle>) -> Option<Arc<ClientHandle>> {
        let previous = self
            .handles
            .write()
            .await
            .insert(handle.session_id.clone(), handle);
        if let Some(ref old) = previous {
            warn!("session {}: replacing registered client handle", old.session_id);
            old.cancel.cancel();
        }
        previous
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ClientHandle>> {
        self.handles.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<ClientHandle>> {
        self.handles.write().await.remove(id)
    }

    /// Remove `handle` only if it is still the one registered for its id.
    pub async fn remove_handle(&self, handle: &Arc<ClientHandle>) -> bool {
        let mut handles = self.handles.write().await;
        match handles.get(&handle.session_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                handles.remove(&handle.session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self) -> Vec<Arc<ClientHandle>> {
        self.handles.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Empty the registry, returning every handle.
    pub async fn drain(&self) -> Vec<Arc<ClientHandle>> {
        self.handles
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }
}
