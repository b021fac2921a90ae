//! QR pairing loop: one task per unpaired session while it pairs.

use super::registry::ClientHandle;
use super::Gateway;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use wagate_core::protocol::{ProtocolEvent, QrEvent};
use wagate_core::session::SessionStatus;
use wagate_whatsapp::generate_qr_terminal;

impl Gateway {
    pub(super) fn spawn_qr_loop(
        self: &Arc<Self>,
        handle: Arc<ClientHandle>,
        codes: mpsc::Receiver<QrEvent>,
    ) {
        handle.set_qr_loop_active(true);
        let gw = self.clone();
        tokio::spawn(async move {
            gw.qr_loop(&handle, codes).await;
            handle.set_qr_loop_active(false);
        });
    }

    async fn qr_loop(&self, handle: &Arc<ClientHandle>, mut codes: mpsc::Receiver<QrEvent>) {
        let id = handle.session_id.as_str();
        let mut issued = 0usize;
        let mut paired = false;
        let mut expiry: Option<Instant> = None;

        loop {
            let fire_at = expiry.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => {
                    debug!("session {id}: QR loop cancelled");
                    return;
                }
                _ = sleep_until(fire_at), if expiry.is_some() => {
                    expiry = None;
                    debug!("session {id}: QR code expired unscanned");
                    self.drop_qr(handle).await;
                }
                event = codes.recv() => match event {
                    Some(QrEvent::Code { code, timeout }) => {
                        let ttl = timeout.unwrap_or_else(|| self.default_qr_ttl(issued));
                        issued += 1;
                        self.on_qr_code(handle, &code, ttl).await;
                        expiry = Some(Instant::now() + ttl);
                    }
                    Some(QrEvent::Success) => {
                        info!("session {id}: QR scanned, pairing");
                        paired = true;
                        self.drop_qr(handle).await;
                        break;
                    }
                    Some(QrEvent::Timeout) => {
                        expiry = None;
                        info!("session {id}: QR pairing timed out");
                        self.drop_qr(handle).await;
                        self.mark_disconnected(handle).await;
                    }
                    Some(QrEvent::Error(reason)) => {
                        warn!("session {id}: QR pairing failed: {reason}");
                        self.drop_qr(handle).await;
                        if let Err(e) = self.repo.set_connection_error(id, Some(&reason)).await {
                            warn!("session {id}: failed to record pairing error: {e}");
                        }
                        handle.set_status(SessionStatus::Error);
                        if self.registry.remove_handle(handle).await {
                            self.release(handle).await;
                        } else {
                            handle.cancel.cancel();
                        }
                        break;
                    }
                    None => break,
                },
            }
        }

        if !paired && !handle.client.is_connected() && !handle.cancel.is_cancelled() {
            debug!("session {id}: QR stream closed without pairing");
            self.drop_qr(handle).await;
            self.mark_disconnected(handle).await;
        }
    }

    /// Lifetime of the `issued`-th code when the library gives none.
    fn default_qr_ttl(&self, issued: usize) -> Duration {
        if issued == 0 {
            self.runtime.first_qr_timeout()
        } else {
            self.runtime.next_qr_timeout()
        }
    }

    async fn on_qr_code(&self, handle: &ClientHandle, code: &str, ttl: Duration) {
        let id = handle.session_id.as_str();
        let now = self.clock.now();
        let lifetime = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(self.runtime.first_qr_timeout_secs as i64));
        let expires_at = now + lifetime;

        if let Err(e) = self.repo.update_last_seen(id, now).await {
            warn!("session {id}: failed to bump last_seen: {e}");
        }
        if let Err(e) = self.repo.update_qr(id, code, expires_at).await {
            warn!("session {id}: failed to store QR code: {e}");
        }
        handle.set_qr(code, expires_at);

        info!("session {id}: new QR code, valid for {}s", ttl.as_secs());
        debug!("session {id}: QR payload {code}");
        if self.print_qr {
            match generate_qr_terminal(code) {
                Ok(art) => println!("\nScan to pair session {id}:\n{art}"),
                Err(e) => warn!("session {id}: failed to render QR: {e}"),
            }
        }

        self.publish(
            id,
            ProtocolEvent::Qr {
                codes: vec![code.to_string()],
            },
        )
        .await;
    }

    async fn drop_qr(&self, handle: &ClientHandle) {
        handle.clear_qr();
        if let Err(e) = self.repo.clear_qr(&handle.session_id).await {
            warn!("session {}: failed to clear QR: {e}", handle.session_id);
        }
    }

    async fn mark_disconnected(&self, handle: &ClientHandle) {
        if let Err(e) = self
            .repo
            .update_connection_status(&handle.session_id, false)
            .await
        {
            warn!("session {}: failed to mark disconnected: {e}", handle.session_id);
        }
        handle.set_status(SessionStatus::Disconnected);
    }
}
