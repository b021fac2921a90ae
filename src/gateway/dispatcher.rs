//! Event dispatcher: applies protocol events to session state, then fans
//! them out to the webhook queue and in-process subscribers.
//!
//! Each session has one supervisor task draining its event channel, so
//! events of one session are applied in the order the library produced them.

use super::Gateway;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wagate_core::error::GatewayError;
use wagate_core::event::{EventKind, GatewayEvent, WebhookEnvelope};
use wagate_core::protocol::ProtocolEvent;
use wagate_core::session::SessionStatus;
use wagate_store::StoreError;

impl Gateway {
    pub(super) fn spawn_supervisor(
        self: &Arc<Self>,
        id: &str,
        mut events: mpsc::Receiver<ProtocolEvent>,
        cancel: CancellationToken,
    ) {
        let gw = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => gw.dispatch(&id, event).await,
                        None => break,
                    },
                }
            }
            debug!("session {id}: supervisor stopped");
        });
    }

    /// Apply one event; publish it unless applying decided to swallow it.
    pub(super) async fn dispatch(&self, id: &str, event: ProtocolEvent) {
        let publish = match self.apply(id, &event).await {
            Ok(publish) => publish,
            Err(e) => {
                warn!("session {id}: failed to apply {} event: {e}", event.name());
                true
            }
        };
        if publish {
            self.publish(id, event).await;
        }
    }

    async fn apply(&self, id: &str, event: &ProtocolEvent) -> Result<bool, GatewayError> {
        let now = self.clock.now();
        match event {
            ProtocolEvent::Connected => return self.on_connected(id).await,
            ProtocolEvent::Disconnected { reason } => {
                self.repo.update_connection_status(id, false).await?;
                self.repo.update_last_seen(id, now).await?;
                if let Some(handle) = self.registry.get(id).await {
                    handle.set_status(SessionStatus::Disconnected);
                }
                info!(
                    "session {id}: disconnected ({})",
                    reason.as_deref().unwrap_or("no reason given")
                );
            }
            ProtocolEvent::LoggedOut { reason } => {
                warn!("session {id}: logged out by peer: {reason}");
                self.repo.mark_logged_out(id, reason).await?;
                if let Some(handle) = self.registry.remove(id).await {
                    handle.shutdown().await;
                    self.devices.delete(&handle.device).await;
                }
            }
            ProtocolEvent::PairSuccess { jid } => {
                self.repo.update_device_jid(id, jid).await?;
                if let Some(handle) = self.registry.get(id).await {
                    handle.clear_qr();
                    handle.set_status(SessionStatus::Connected);
                }
                info!("session {id}: paired as {jid}");
            }
            ProtocolEvent::Qr { .. }
            | ProtocolEvent::Message(_)
            | ProtocolEvent::Receipt(_)
            | ProtocolEvent::Presence(_)
            | ProtocolEvent::ChatPresence(_)
            | ProtocolEvent::HistorySync(_) => {
                self.repo.update_last_seen(id, now).await?;
            }
            _ => {}
        }
        Ok(true)
    }

    /// Commit a live connection. A session without a stored JID takes the
    /// client's; with no JID anywhere the event is dropped.
    async fn on_connected(&self, id: &str) -> Result<bool, GatewayError> {
        match self.repo.mark_connected(id).await {
            Ok(()) => {}
            Err(StoreError::Invalid(_)) => {
                let jid = match self.registry.get(id).await {
                    Some(handle) => handle.client.device_jid(),
                    None => None,
                };
                let Some(jid) = jid else {
                    warn!("session {id}: connected without a device jid, ignoring");
                    return Ok(false);
                };
                self.repo.update_device_jid(id, &jid).await?;
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(handle) = self.registry.get(id).await {
            handle.clear_qr();
            handle.set_status(SessionStatus::Connected);
        }
        info!("session {id}: connected");
        Ok(true)
    }

    /// Hand `event` to the webhook queue (never waits) and to subscribers.
    pub(super) async fn publish(&self, id: &str, event: ProtocolEvent) {
        let event = GatewayEvent {
            session_id: id.to_string(),
            timestamp: self.clock.now(),
            event,
        };

        if let Some(kind) = EventKind::of(&event.event) {
            let queue = self.webhooks.lock().clone();
            if let Some(queue) = queue {
                queue.enqueue(WebhookEnvelope {
                    kind,
                    session_id: event.session_id.clone(),
                    event: payload(&event.event),
                    timestamp: event.timestamp,
                });
            }
        }

        let failed = self.subscribers.notify(&event).await;
        if failed > 0 {
            debug!(
                "session {id}: {failed} subscriber(s) failed on {} event",
                event.event.name()
            );
        }
    }
}

/// Webhook body of an event: its data, or an empty object for bare events.
fn payload(event: &ProtocolEvent) -> Value {
    match serde_json::to_value(event) {
        Ok(mut value) => value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| json!({})),
        Err(e) => {
            warn!("failed to serialize {} event: {e}", event.name());
            json!({})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_unwraps_event_data() {
        let qr = payload(&ProtocolEvent::Qr {
            codes: vec!["2@abc".into()],
        });
        assert_eq!(qr, json!({"codes": ["2@abc"]}));

        let msg = payload(&ProtocolEvent::Message(json!({"id": "m1"})));
        assert_eq!(msg["id"], "m1");

        assert_eq!(payload(&ProtocolEvent::Connected), json!({}));
    }
}
