//! Gateway: owns the fleet of live sessions.
//!
//! - `registry`: id → live client handle
//! - `device`: device store adapter
//! - `lifecycle`: create/connect/disconnect/logout/delete
//! - `qr_loop`: per-session QR pairing task
//! - `dispatcher`: applies protocol events and fans them out
//! - `reconciler`: startup reload, auto-reconnect, QR sweeper
//! - `subscribers`: in-process event handlers
//!
//! Lifecycle operations on one session are mutually exclusive: a second
//! caller while one is in flight gets `Busy` rather than queueing.

mod device;
mod dispatcher;
mod lifecycle;
mod qr_loop;
mod reconciler;
mod registry;
mod subscribers;

#[cfg(test)]
pub(crate) mod fakes;

pub use subscribers::{Capability, Handler};

use crate::webhook::WebhookQueue;
use chrono::{DateTime, Utc};
use device::DeviceAdapter;
use lifecycle::OpGuard;
use parking_lot::Mutex;
use registry::Registry;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use subscribers::Subscribers;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wagate_core::clock::SharedClock;
use wagate_core::config::RuntimeConfig;
use wagate_core::error::GatewayError;
use wagate_core::protocol::DeviceContainer;
use wagate_core::session::{ProxyConfig, QrInfo, Session};
use wagate_store::SessionRepository;

/// Fleet counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: i64,
    pub connected: i64,
    pub offline: i64,
}

/// The session gateway.
pub struct Gateway {
    repo: SessionRepository,
    devices: DeviceAdapter,
    registry: Registry,
    subscribers: Subscribers,
    webhooks: Mutex<Option<WebhookQueue>>,
    guard: OpGuard,
    clock: SharedClock,
    runtime: RuntimeConfig,
    print_qr: bool,
    /// Parent of every session token.
    root: CancellationToken,
}

impl Gateway {
    pub fn new(
        repo: SessionRepository,
        container: Arc<dyn DeviceContainer>,
        clock: SharedClock,
        runtime: RuntimeConfig,
        print_qr: bool,
        webhooks: Option<WebhookQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            devices: DeviceAdapter::new(container),
            registry: Registry::default(),
            subscribers: Subscribers::default(),
            webhooks: Mutex::new(webhooks),
            guard: OpGuard::default(),
            clock,
            runtime,
            print_qr,
            root: CancellationToken::new(),
        })
    }

    /// Reload persisted sessions and start the QR sweeper.
    pub async fn run(self: &Arc<Self>) -> Result<JoinHandle<()>, GatewayError> {
        let restored = self.reconcile_startup().await?;
        info!(
            "wagate gateway running | sessions: {} | reconnecting: {}",
            restored.registered, restored.reconnecting
        );
        let gw = self.clone();
        Ok(tokio::spawn(async move { gw.qr_sweeper().await }))
    }

    /// Cancel every session task, disconnect every client, clear the
    /// registry, and release the webhook queue. Persisted state is left as
    /// is so the next start can reconnect. Unpaired devices are deleted; the
    /// next start allocates fresh ones.
    pub async fn shutdown(&self) {
        info!("Shutting down gateway...");
        self.root.cancel();
        for handle in self.registry.drain().await {
            self.release(&handle).await;
        }
        self.webhooks.lock().take();
        info!("Gateway shutdown complete");
    }

    /// Current time on the gateway's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // --- Reads ---

    pub async fn get(&self, id: &str) -> Result<Session, GatewayError> {
        let session = self.repo.get_by_id(id).await?;
        Ok(self.observe(session).await)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Session, GatewayError> {
        let session = self.repo.get_by_name(name).await?;
        Ok(self.observe(session).await)
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Session>, GatewayError> {
        if limit < 0 || offset < 0 {
            return Err(GatewayError::Validation(
                "limit and offset must be non-negative".into(),
            ));
        }
        let sessions = self.repo.list(limit, offset).await?;
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(self.observe(session).await);
        }
        Ok(out)
    }

    pub async fn list_connected(&self) -> Result<Vec<Session>, GatewayError> {
        let sessions = self.repo.list_connected().await?;
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            let session = self.observe(session).await;
            if session.is_connected {
                out.push(session);
            }
        }
        Ok(out)
    }

    pub async fn stats(&self) -> Result<Stats, GatewayError> {
        let total = self.repo.count().await?;
        let connected = self.repo.count_connected().await?;
        Ok(Stats {
            total,
            connected,
            offline: total - connected,
        })
    }

    /// Bring a freshly read row in line with what is known in memory: an
    /// expired QR is cleared, and a live client whose connection state
    /// diverges from the row wins unless a lifecycle operation is tearing
    /// it down.
    async fn observe(&self, mut session: Session) -> Session {
        let now = self.clock.now();
        let handle = self.registry.get(&session.id).await;

        if session.clear_expired_qr(now) {
            if let Err(e) = self.repo.clear_qr(&session.id).await {
                warn!("session {}: failed to clear expired QR: {e}", session.id);
            }
            if let Some(ref h) = handle {
                h.clear_expired_qr(now);
            }
        }

        let Some(handle) = handle else {
            return session;
        };
        if self.guard.is_held(&session.id) {
            return session;
        }
        let live = handle.client.is_connected();
        if live == session.is_connected || (live && session.device_jid.is_none()) {
            return session;
        }
        match self.repo.update_connection_status(&session.id, live).await {
            Ok(()) => {
                session.is_connected = live;
                if live {
                    session.connected_at = Some(now);
                    session.last_seen = Some(now);
                }
                session.updated_at = now;
            }
            Err(e) => warn!(
                "session {}: failed to reconcile connection state: {e}",
                session.id
            ),
        }
        session
    }

    // --- QR ---

    /// Return the current QR, or start pairing and wait for the first code.
    pub async fn generate_qr(
        self: &Arc<Self>,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<QrInfo, GatewayError> {
        let session = self.get(id).await?;
        if session.is_connected {
            return Err(GatewayError::AlreadyConnected(format!(
                "session {id} is connected"
            )));
        }
        if session.is_paired() {
            return Err(GatewayError::Validation(format!(
                "session {id} is already paired; connect it instead"
            )));
        }
        let now = self.clock.now();
        if let Some(qr) = session.qr_at(now) {
            return Ok(qr);
        }

        let pairing = match self.registry.get(id).await {
            Some(handle) => handle.qr_loop_active(),
            None => false,
        };
        if !pairing {
            self.connect(id, cancel).await?;
        }

        let deadline = tokio::time::Instant::now() + self.runtime.qr_wait_timeout();
        loop {
            if let Some(handle) = self.registry.get(id).await {
                let now = self.clock.now();
                if let Some(qr) = handle.qr_at(now) {
                    return Ok(qr);
                }
                if handle.qr().is_some() {
                    return Err(GatewayError::QrExpired(format!(
                        "QR code for session {id} expired before it was read"
                    )));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::QrGenerationTimeout(format!(
                    "no QR code for session {id} within {}s",
                    self.runtime.qr_wait_timeout().as_secs()
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(GatewayError::Cancelled("generate_qr cancelled".into()));
                }
                _ = tokio::time::sleep(self.runtime.qr_poll_interval()) => {}
            }
        }
    }

    /// The current QR, never waiting.
    pub async fn get_qr(&self, id: &str) -> Result<QrInfo, GatewayError> {
        let session = self.get(id).await?;
        session.qr_at(self.clock.now()).ok_or_else(|| {
            GatewayError::QrNotAvailable(format!("no valid QR code for session {id}"))
        })
    }

    // --- Proxy ---

    /// Store the session's proxy. It takes effect on the next connect.
    pub async fn set_proxy(
        &self,
        id: &str,
        proxy: Option<ProxyConfig>,
    ) -> Result<Session, GatewayError> {
        if let Some(ref p) = proxy {
            p.validate()?;
        }
        self.repo.update_proxy(id, proxy.as_ref()).await?;
        info!(
            "session {id}: proxy {} (applies on next connect)",
            if proxy.is_some() { "set" } else { "cleared" }
        );
        self.get(id).await
    }

    pub async fn get_proxy(&self, id: &str) -> Result<Option<ProxyConfig>, GatewayError> {
        Ok(self.repo.get_by_id(id).await?.proxy_config)
    }

    // --- Subscribers ---

    /// Register a handler for every event.
    pub fn subscribe(&self, handler: Handler) {
        self.subscribers.add(Capability::Any, handler);
    }

    /// Register a handler for one kind of event.
    pub fn subscribe_to(&self, capability: Capability, handler: Handler) {
        self.subscribers.add(capability, handler);
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled("operation cancelled".into())),
        result = fut => result,
    }
}
