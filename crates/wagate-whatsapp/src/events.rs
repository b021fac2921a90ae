//! Translation of `whatsapp-rust` bot events into gateway protocol events.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wacore::types::events::Event;
use wagate_core::protocol::{ProtocolEvent, QrEvent};

use crate::device_store::DeviceScope;

/// State shared between a [`crate::WhatsAppClient`] and its bot's event handler.
pub(crate) struct Shared {
    pub(crate) scope: DeviceScope,
    pub(crate) label: String,
    pub(crate) connected: AtomicBool,
    pub(crate) jid: Mutex<Option<String>>,
    /// Open while a pairing is in progress.
    pub(crate) qr_tx: Mutex<Option<mpsc::Sender<QrEvent>>>,
    pub(crate) events: mpsc::Sender<ProtocolEvent>,
}

impl Shared {
    async fn emit(&self, event: ProtocolEvent) {
        if self.events.send(event).await.is_err() {
            debug!("{}: event receiver gone, dropping event", self.label);
        }
    }

    async fn send_qr(&self, event: QrEvent) {
        let tx = self.qr_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.send(event).await.is_err() {
                *self.qr_tx.lock() = None;
            }
        }
    }

    /// Send a terminal QR event and close the stream.
    pub(crate) async fn finish_qr(&self, event: QrEvent) {
        let tx = self.qr_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

pub(crate) async fn handle_event(event: Event, shared: &Shared) {
    match event {
        Event::PairingQrCode { code, timeout } => {
            info!("{}: QR code generated (scan to pair)", shared.label);
            debug!("{}: QR data: {code}", shared.label);
            let timeout = (!timeout.is_zero()).then_some(timeout);
            shared.send_qr(QrEvent::Code { code, timeout }).await;
        }
        Event::PairSuccess(pair) => {
            let jid = pair.id.to_string();
            info!("{}: pairing successful as {jid}", shared.label);
            if let Err(e) = shared.scope.bind_jid(&jid).await {
                warn!("{}: failed to bind device jid {jid}: {e}", shared.label);
            }
            *shared.jid.lock() = Some(jid.clone());
            shared.finish_qr(QrEvent::Success).await;
            shared.emit(ProtocolEvent::PairSuccess { jid }).await;
        }
        Event::Connected(_) => {
            info!("{}: connected", shared.label);
            shared.connected.store(true, Ordering::SeqCst);
            shared.emit(ProtocolEvent::Connected).await;
        }
        Event::Disconnected(_) => {
            warn!("{}: disconnected", shared.label);
            shared.connected.store(false, Ordering::SeqCst);
            shared.finish_qr(QrEvent::Timeout).await;
            shared.emit(ProtocolEvent::Disconnected { reason: None }).await;
        }
        Event::LoggedOut(_) => {
            warn!("{}: logged out, credentials invalidated", shared.label);
            shared.connected.store(false, Ordering::SeqCst);
            *shared.jid.lock() = None;
            shared
                .finish_qr(QrEvent::Error("logged out by peer".into()))
                .await;
            shared
                .emit(ProtocolEvent::LoggedOut {
                    reason: "logged out by peer".into(),
                })
                .await;
        }
        Event::Message(msg, info) => {
            shared
                .emit(ProtocolEvent::Message(message_payload(&msg, &info)))
                .await;
        }
        Event::Receipt(receipt) => {
            shared.emit(ProtocolEvent::Receipt(to_payload(&receipt))).await;
        }
        Event::Presence(presence) => {
            shared.emit(ProtocolEvent::Presence(to_payload(&presence))).await;
        }
        Event::ChatPresence(presence) => {
            shared
                .emit(ProtocolEvent::ChatPresence(to_payload(&presence)))
                .await;
        }
        Event::PictureUpdate(picture) => {
            shared.emit(ProtocolEvent::Picture(to_payload(&picture))).await;
        }
        Event::ContactUpdate(contact) => {
            shared.emit(ProtocolEvent::Contact(to_payload(&contact))).await;
        }
        Event::PushNameUpdate(update) => {
            shared.emit(ProtocolEvent::Contact(to_payload(&update))).await;
        }
        Event::UserAboutUpdate(update) => {
            shared.emit(ProtocolEvent::Contact(to_payload(&update))).await;
        }
        Event::GroupInfoUpdate { jid, .. } => {
            shared
                .emit(ProtocolEvent::GroupInfo(json!({ "jid": jid.to_string() })))
                .await;
        }
        Event::HistorySync(sync) => {
            debug!(
                "{}: history sync chunk with {} conversation(s)",
                shared.label,
                sync.conversations.len()
            );
            shared
                .emit(ProtocolEvent::HistorySync(history_payload(&sync)))
                .await;
        }
        Event::OfflineSyncCompleted(done) => {
            debug!("{}: offline sync completed ({} item(s))", shared.label, done.count);
            shared.emit(ProtocolEvent::AppStateSyncComplete).await;
        }
        _ => {
            debug!("{}: unhandled whatsapp event", shared.label);
        }
    }
}

/// Library event structs serialize as-is; a failure yields `null`.
fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Summary of one history sync chunk. Conversation bodies stay out of the
/// payload.
pub(crate) fn history_payload(sync: &waproto::whatsapp::HistorySync) -> Value {
    json!({
        "syncType": sync.sync_type,
        "conversations": sync.conversations.len(),
        "chunkOrder": sync.chunk_order,
        "progress": sync.progress,
    })
}

/// Flatten an incoming message into the webhook payload.
fn message_payload(
    msg: &waproto::whatsapp::Message,
    info: &wacore::types::message::MessageInfo,
) -> Value {
    // Unwrap nested wrappers (device_sent, ephemeral, view_once).
    let inner = msg
        .device_sent_message
        .as_ref()
        .and_then(|d| d.message.as_deref())
        .or_else(|| {
            msg.ephemeral_message
                .as_ref()
                .and_then(|e| e.message.as_deref())
        })
        .or_else(|| {
            msg.view_once_message
                .as_ref()
                .and_then(|v| v.message.as_deref())
        })
        .unwrap_or(msg);

    let text = inner.conversation.as_deref().or_else(|| {
        inner
            .extended_text_message
            .as_ref()
            .and_then(|e| e.text.as_deref())
    });

    json!({
        "id": info.id,
        "chat": info.source.chat.to_string(),
        "sender": info.source.sender.to_string(),
        "fromMe": info.source.is_from_me,
        "isGroup": info.source.is_group,
        "pushName": info.push_name,
        "text": text,
        "hasImage": inner.image_message.is_some(),
        "hasAudio": inner.audio_message.is_some(),
    })
}
