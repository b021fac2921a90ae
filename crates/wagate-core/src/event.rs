//! Gateway events as seen by subscribers and webhook receivers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::ProtocolEvent;

/// Webhook event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    Connected,
    Disconnected,
    #[serde(rename = "QR")]
    Qr,
    ReadReceipt,
    Presence,
    ChatPresence,
    HistorySync,
    LoggedOut,
    PairSuccess,
}

impl EventKind {
    /// Webhook kind for a protocol event. `None` for events that are only
    /// offered to in-process subscribers.
    pub fn of(event: &ProtocolEvent) -> Option<Self> {
        match event {
            ProtocolEvent::Message(_) => Some(Self::Message),
            ProtocolEvent::Connected => Some(Self::Connected),
            ProtocolEvent::Disconnected { .. } => Some(Self::Disconnected),
            ProtocolEvent::Qr { .. } => Some(Self::Qr),
            ProtocolEvent::Receipt(_) => Some(Self::ReadReceipt),
            ProtocolEvent::Presence(_) => Some(Self::Presence),
            ProtocolEvent::ChatPresence(_) => Some(Self::ChatPresence),
            ProtocolEvent::HistorySync(_) => Some(Self::HistorySync),
            ProtocolEvent::LoggedOut { .. } => Some(Self::LoggedOut),
            ProtocolEvent::PairSuccess { .. } => Some(Self::PairSuccess),
            _ => None,
        }
    }
}

/// An event after the gateway has applied it, tagged with its session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: ProtocolEvent,
}

/// Outbound webhook body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub event: Value,
    pub timestamp: DateTime<Utc>,
}

/// Destination for webhook envelopes.
///
/// The gateway never awaits a sink on its event path; envelopes are queued
/// and delivered by a background worker.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, envelope: &WebhookEnvelope) -> Result<(), GatewayError>;
}
