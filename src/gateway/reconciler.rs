//! Startup reconciliation, boot-time auto-reconnect, and the QR sweeper.

use super::Gateway;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use wagate_core::error::GatewayError;

/// Outcome of the startup pass.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Restored {
    pub registered: usize,
    pub reconnecting: usize,
}

impl Gateway {
    /// Register a handle for every persisted session and schedule a delayed
    /// reconnect for those that were connected when the process stopped.
    /// Unpaired sessions get a fresh device, so unpaired leftovers of an
    /// earlier run are purged first.
    pub(super) async fn reconcile_startup(self: &Arc<Self>) -> Result<Restored, GatewayError> {
        let sessions = self.repo.list_all().await?;
        let mut restored = Restored::default();

        if self.registry.len().await == 0 {
            self.devices.purge_unpaired().await;
        }

        for session in sessions {
            if self.root.is_cancelled() {
                break;
            }
            let id = session.id.clone();
            if self.registry.get(&id).await.is_some() {
                continue;
            }

            // A code from a previous process can never be scanned.
            if session.qr_code.is_some() || session.qr_expires_at.is_some() {
                if let Err(e) = self.repo.clear_qr(&id).await {
                    warn!("session {id}: failed to clear stale QR: {e}");
                }
            }

            let device = match self
                .devices
                .get_or_create(session.device_jid.as_deref())
                .await
            {
                Ok(device) => device,
                Err(e) => {
                    warn!("session {id}: failed to restore device: {e}");
                    self.record_error(&id, &e).await;
                    continue;
                }
            };

            if session.is_paired() && !device.is_paired() {
                warn!("session {id}: stored credentials missing, session needs pairing");
                if let Err(e) = self
                    .repo
                    .mark_logged_out(&id, "device credentials missing")
                    .await
                {
                    warn!("session {id}: failed to unpair: {e}");
                }
            }
            let reconnect = session.is_connected && session.is_paired() && device.is_paired();

            if let Err(e) = self.build_handle(&id, device).await {
                warn!("session {id}: failed to build client: {e}");
                self.record_error(&id, &e).await;
                continue;
            }
            restored.registered += 1;

            if session.is_connected {
                // Not connected until the protocol says so again.
                if let Err(e) = self.repo.update_connection_status(&id, false).await {
                    warn!("session {id}: failed to reset connection flag: {e}");
                }
            }
            if reconnect {
                self.schedule_reconnect(id);
                restored.reconnecting += 1;
            }
        }
        Ok(restored)
    }

    fn schedule_reconnect(self: &Arc<Self>, id: String) {
        let gw = self.clone();
        let delay = self.runtime.reconnect_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = gw.root.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            info!("session {id}: auto-reconnecting");
            let cancel = gw.root.child_token();
            match gw.connect(&id, &cancel).await {
                Ok(()) | Err(GatewayError::AlreadyConnected(_)) | Err(GatewayError::Cancelled(_)) => {}
                Err(e) => warn!("session {id}: auto-reconnect failed: {e}"),
            }
        });
    }

    async fn record_error(&self, id: &str, error: &GatewayError) {
        let reason = error.to_string();
        if let Err(e) = self.repo.set_connection_error(id, Some(&reason)).await {
            warn!("session {id}: failed to record error: {e}");
        }
    }

    pub(super) async fn qr_sweeper(&self) {
        let mut tick = tokio::time::interval(self.runtime.qr_sweep_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.root.cancelled() => break,
                _ = tick.tick() => {
                    self.sweep_expired_qr().await;
                }
            }
        }
        debug!("QR sweeper stopped");
    }

    /// Clear every expired QR held by a live handle. Returns how many.
    pub(super) async fn sweep_expired_qr(&self) -> usize {
        let now = self.clock.now();
        let mut cleared = 0;
        for handle in self.registry.list().await {
            if handle.clear_expired_qr(now) {
                cleared += 1;
                if let Err(e) = self.repo.clear_qr(&handle.session_id).await {
                    warn!("session {}: failed to clear expired QR: {e}", handle.session_id);
                }
            }
        }
        if cleared > 0 {
            debug!("QR sweeper cleared {cleared} expired code(s)");
        }
        cleared
    }
}
