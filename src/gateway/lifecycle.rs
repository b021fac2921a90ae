//! Lifecycle controller: create, connect, disconnect, logout, delete.
//!
//! Every operation but `create` holds the session's [`OpPermit`] for its
//! whole run. The `*_locked` helpers assume the permit is already held.
//!
//! State is persisted before a live handle is torn down, so a failed write
//! leaves the session registered and retryable.

use super::registry::ClientHandle;
use super::{cancellable, Gateway};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wagate_core::error::GatewayError;
use wagate_core::protocol::{DeviceHandle, ProtocolClient, ProtocolEvent};
use wagate_core::session::{validate_session_name, ProxyConfig, Session, SessionStatus};
use wagate_store::StoreError;

/// Per-session mutual exclusion for lifecycle operations.
#[derive(Default)]
pub(crate) struct OpGuard {
    held: Mutex<HashSet<String>>,
}

impl OpGuard {
    /// Take the session's permit, or fail with `Busy` if another operation
    /// holds it.
    pub fn acquire(&self, id: &str) -> Result<OpPermit<'_>, GatewayError> {
        if !self.held.lock().insert(id.to_string()) {
            return Err(GatewayError::Busy(format!(
                "another operation is in progress on session {id}"
            )));
        }
        Ok(OpPermit {
            guard: self,
            id: id.to_string(),
        })
    }

    /// Whether an operation on `id` is in flight.
    pub fn is_held(&self, id: &str) -> bool {
        self.held.lock().contains(id)
    }
}

/// Released on drop.
pub(crate) struct OpPermit<'a> {
    guard: &'a OpGuard,
    id: String,
}

impl Drop for OpPermit<'_> {
    fn drop(&mut self) {
        self.guard.held.lock().remove(&self.id);
    }
}

impl Gateway {
    /// Create a session with a fresh unpaired device and register its handle.
    pub async fn create(
        self: &Arc<Self>,
        name: &str,
        proxy: Option<ProxyConfig>,
        cancel: &CancellationToken,
    ) -> Result<Session, GatewayError> {
        validate_session_name(name)?;
        if let Some(ref p) = proxy {
            p.validate()?;
        }
        let exists = cancellable(cancel, async {
            self.repo.exists_by_name(name).await.map_err(GatewayError::from)
        })
        .await?;
        if exists {
            return Err(GatewayError::SessionExists(format!(
                "session '{name}' already exists"
            )));
        }
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled("create cancelled".into()));
        }

        // Past this point the operation runs to completion.
        let session = Session::new(name, proxy, self.clock.now());
        self.repo.create(&session).await?;

        if let Err(e) = self.register_new(&session.id).await {
            warn!("session {}: setup failed, rolling back: {e}", session.id);
            if let Some(handle) = self.registry.remove(&session.id).await {
                self.release(&handle).await;
            }
            if let Err(re) = self.repo.delete(&session.id).await {
                warn!("session {}: rollback delete failed: {re}", session.id);
            }
            return Err(e);
        }

        info!("session {}: created '{}'", session.id, session.name);
        Ok(session)
    }

    pub async fn connect(
        self: &Arc<Self>,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let _permit = self.guard.acquire(id)?;
        self.connect_locked(id, cancel).await
    }

    pub async fn disconnect(&self, id: &str, cancel: &CancellationToken) -> Result<(), GatewayError> {
        let _permit = self.guard.acquire(id)?;
        let session = cancellable(cancel, self.load(id)).await?;

        let handle = self.registry.get(id).await;
        let live = handle
            .as_ref()
            .is_some_and(|h| h.client.is_connected() || h.qr_loop_active());
        if !session.is_connected && session.qr_code.is_none() && !live {
            debug!("session {id}: already disconnected");
            return Ok(());
        }

        // Past this point the operation runs to completion.
        self.repo.update_connection_status(id, false).await?;
        if let Some(handle) = self.registry.remove(id).await {
            self.release(&handle).await;
        }
        // Cleared after teardown so the QR loop cannot write a late code back.
        self.repo.clear_qr(id).await?;
        info!("session {id}: disconnected");
        self.publish(
            id,
            ProtocolEvent::Disconnected {
                reason: Some("disconnected by operator".into()),
            },
        )
        .await;
        Ok(())
    }

    pub async fn logout(&self, id: &str, cancel: &CancellationToken) -> Result<(), GatewayError> {
        let _permit = self.guard.acquire(id)?;
        let session = cancellable(cancel, self.load(id)).await?;
        self.logout_locked(session).await
    }

    /// Remove a session and its credentials. Deleting an unknown id succeeds.
    pub async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<(), GatewayError> {
        let _permit = self.guard.acquire(id)?;
        let session = match cancellable(cancel, self.load(id)).await {
            Ok(session) => session,
            Err(GatewayError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if session.is_connected {
            if let Err(e) = self.logout_locked(session).await {
                warn!("session {id}: logout before delete failed: {e}");
            }
        } else {
            let device = match self.registry.remove(id).await {
                Some(handle) => {
                    handle.shutdown().await;
                    Some(handle.device.clone())
                }
                None => self.stored_device(&session).await,
            };
            if let Some(device) = device {
                self.devices.delete(&device).await;
            }
        }

        match self.repo.delete(id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!("session {id}: deleted");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Session, GatewayError> {
        Ok(self.repo.get_by_id(id).await?)
    }

    async fn register_new(self: &Arc<Self>, id: &str) -> Result<Arc<ClientHandle>, GatewayError> {
        let device = self.devices.new_device().await?;
        self.build_handle(id, device).await
    }

    /// Build a client on `device`, start its supervisor, and register it.
    pub(super) async fn build_handle(
        self: &Arc<Self>,
        id: &str,
        device: DeviceHandle,
    ) -> Result<Arc<ClientHandle>, GatewayError> {
        let (tx, rx) = mpsc::channel(self.runtime.event_buffer.max(1));
        let client = match self
            .devices
            .container()
            .new_client(device.clone(), tx)
            .await
        {
            Ok(client) => client,
            Err(e) => {
                if !device.is_paired() {
                    self.devices.delete(&device).await;
                }
                return Err(e);
            }
        };

        let cancel = self.root.child_token();
        let handle = Arc::new(ClientHandle::new(id, client, device, cancel.clone()));
        self.spawn_supervisor(id, rx, cancel);
        if let Some(old) = self.registry.put(handle.clone()).await {
            self.release(&old).await;
        }
        Ok(handle)
    }

    /// Tear a handle down. A device that never paired holds nothing worth
    /// keeping and is deleted with it.
    pub(super) async fn release(&self, handle: &ClientHandle) {
        handle.shutdown().await;
        if !handle.client.is_paired() {
            debug!(
                "session {}: releasing unpaired device {}",
                handle.session_id,
                handle.device.key()
            );
            self.devices.delete(&handle.device).await;
        }
    }

    async fn connect_locked(
        self: &Arc<Self>,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let session = cancellable(cancel, self.load(id)).await?;
        if session.is_connected {
            return Err(GatewayError::AlreadyConnected(format!(
                "session {id} is already connected"
            )));
        }

        let (handle, restored) = match self.registry.get(id).await {
            Some(handle) => (handle, false),
            None => {
                let device = cancellable(
                    cancel,
                    self.devices.get_or_create(session.device_jid.as_deref()),
                )
                .await?;
                (self.build_handle(id, device).await?, true)
            }
        };

        if handle.client.is_connected() {
            return Err(GatewayError::AlreadyConnected(format!(
                "session {id} is already connected"
            )));
        }
        if handle.qr_loop_active() {
            debug!("session {id}: pairing already in progress");
            return Ok(());
        }

        match cancellable(cancel, self.start_client(&handle, &session)).await {
            Ok(()) => {
                info!("session {id}: connecting");
                Ok(())
            }
            Err(e) => {
                if restored && self.registry.remove_handle(&handle).await {
                    self.release(&handle).await;
                } else {
                    handle.client.disconnect().await;
                }
                if !matches!(e, GatewayError::Cancelled(_)) {
                    warn!("session {id}: connect failed: {e}");
                    let reason = e.to_string();
                    if let Err(se) = self.repo.set_connection_error(id, Some(&reason)).await {
                        warn!("session {id}: failed to record connection error: {se}");
                    }
                }
                Err(match e {
                    GatewayError::Cancelled(_)
                    | GatewayError::ProxyError(_)
                    | GatewayError::ConnectionFailed(_) => e,
                    other => GatewayError::ConnectionFailed(other.to_string()),
                })
            }
        }
    }

    /// Apply the proxy and start the protocol connection. An unpaired device
    /// subscribes to its QR stream before connecting and hands it to the QR
    /// loop.
    async fn start_client(
        self: &Arc<Self>,
        handle: &Arc<ClientHandle>,
        session: &Session,
    ) -> Result<(), GatewayError> {
        if let Some(ref proxy) = session.proxy_config {
            handle.client.set_proxy(Some(proxy)).await?;
        }

        let timeout = self.runtime.connect_timeout();
        let connect = async {
            tokio::time::timeout(timeout, handle.client.connect())
                .await
                .map_err(|_| {
                    GatewayError::ConnectionFailed(format!(
                        "connect timed out after {}s",
                        timeout.as_secs()
                    ))
                })?
        };

        if handle.client.is_paired() {
            connect.await?;
        } else {
            let qr = handle.client.qr_channel().await?;
            connect.await?;
            self.spawn_qr_loop(handle.clone(), qr);
        }
        handle.set_status(SessionStatus::Connecting);
        Ok(())
    }

    /// Persist the unpaired state, then drop the handle and invalidate the
    /// credentials. Protocol failures are logged and cleanup continues.
    async fn logout_locked(&self, session: Session) -> Result<(), GatewayError> {
        let id = session.id.clone();
        if self.registry.get(&id).await.is_none() && !session.is_paired() && !session.is_connected
        {
            if session.qr_code.is_some() {
                self.repo.clear_qr(&id).await?;
            }
            debug!("session {id}: already logged out");
            return Ok(());
        }

        // Resolve the stored device before the row forgets its JID.
        let stored = match self.registry.get(&id).await {
            Some(_) => None,
            None => self.stored_device(&session).await,
        };

        let now = self.clock.now();
        let mut updated = session;
        updated.device_jid = None;
        updated.is_connected = false;
        updated.connection_error = None;
        updated.qr_code = None;
        updated.qr_expires_at = None;
        updated.last_seen = Some(now);
        self.repo.update(&updated).await?;

        let (client, device) = match self.registry.remove(&id).await {
            Some(handle) => {
                handle.cancel.cancel();
                (Some(handle.client.clone()), Some(handle.device.clone()))
            }
            None => match stored {
                Some(device) => (self.detached_client(&device).await, Some(device)),
                None => (None, None),
            },
        };

        if let Some(client) = client {
            if client.is_paired() {
                if let Err(e) = client.logout().await {
                    warn!("session {id}: protocol logout failed, continuing cleanup: {e}");
                }
            }
            client.disconnect().await;
        }
        if let Some(device) = device {
            self.devices.delete(&device).await;
        }

        info!("session {id}: logged out");
        self.publish(
            &id,
            ProtocolEvent::LoggedOut {
                reason: "logged out by operator".into(),
            },
        )
        .await;
        Ok(())
    }

    /// The stored device of a paired session that has no live handle.
    async fn stored_device(&self, session: &Session) -> Option<DeviceHandle> {
        let jid = session.device_jid.as_deref()?;
        match self.devices.container().load_device(jid).await {
            Ok(device) => device,
            Err(e) => {
                warn!("session {}: failed to load device {jid}: {e}", session.id);
                None
            }
        }
    }

    /// A client that is never registered, used only to log a device out.
    async fn detached_client(&self, device: &DeviceHandle) -> Option<Arc<dyn ProtocolClient>> {
        let (tx, _rx) = mpsc::channel(1);
        match self.devices.container().new_client(device.clone(), tx).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("failed to open device {} for logout: {e}", device.key());
                None
            }
        }
    }
}
