//! The seam between the gateway and the WhatsApp protocol library.
//!
//! The gateway only ever talks to these traits. The `wagate-whatsapp` crate
//! implements them on top of `whatsapp-rust`; tests implement them with fakes.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::session::ProxyConfig;

/// Opaque reference to one device's credential store.
///
/// Only a [`DeviceContainer`] creates these. The key is meaningful to the
/// container alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    key: i64,
    jid: Option<String>,
}

impl DeviceHandle {
    pub fn new(key: i64, jid: Option<String>) -> Self {
        Self { key, jid }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// JID the device was paired as, if any.
    pub fn jid(&self) -> Option<&str> {
        self.jid.as_deref()
    }

    pub fn is_paired(&self) -> bool {
        self.jid.is_some()
    }
}

/// Capability to load and create devices, and to build clients on them.
#[async_trait]
pub trait DeviceContainer: Send + Sync {
    /// Load the device previously paired as `jid`. `Ok(None)` if unknown.
    async fn load_device(&self, jid: &str) -> Result<Option<DeviceHandle>, GatewayError>;

    /// Allocate a fresh, unpaired device.
    async fn new_device(&self) -> Result<DeviceHandle, GatewayError>;

    /// Drop every credential row of a device.
    async fn delete_device(&self, device: &DeviceHandle) -> Result<(), GatewayError>;

    /// Delete every device that never completed pairing. Returns how many.
    async fn purge_unpaired(&self) -> Result<usize, GatewayError>;

    /// Build a client bound to `device`. Every protocol event the client
    /// produces is sent, in order, on `events`.
    async fn new_client(
        &self,
        device: DeviceHandle,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolClient>, GatewayError>;
}

/// One live protocol connection.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Start connecting. Returns once the attempt is underway; progress is
    /// reported through the event stream.
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Close the connection. Credentials are kept.
    async fn disconnect(&self);

    /// Ask the peer to unlink this device, then wipe the local credentials.
    /// An unreachable peer is not an error; the local wipe still happens.
    async fn logout(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    /// Whether the device holds credentials from a completed pairing.
    fn is_paired(&self) -> bool;

    fn device_jid(&self) -> Option<String>;

    /// Subscribe to QR pairing events. Must be called before `connect` on an
    /// unpaired device so no code is missed.
    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, GatewayError>;

    /// Apply (or clear) the outbound proxy. Takes effect on the next connect.
    async fn set_proxy(&self, proxy: Option<&ProxyConfig>) -> Result<(), GatewayError>;
}

/// Events on the QR pairing stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrEvent {
    /// A new code to display. `timeout` is `None` when the library does not
    /// say how long the code lives.
    Code {
        code: String,
        timeout: Option<Duration>,
    },
    Success,
    Timeout,
    Error(String),
}

/// Everything the protocol library reports for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Connected,
    Disconnected { reason: Option<String> },
    LoggedOut { reason: String },
    PairSuccess { jid: String },
    Qr { codes: Vec<String> },
    Message(Value),
    Receipt(Value),
    Presence(Value),
    ChatPresence(Value),
    HistorySync(Value),
    GroupInfo(Value),
    Contact(Value),
    Picture(Value),
    BusinessName(Value),
    KeepAliveTimeout,
    KeepAliveRestored,
    AppStateSyncComplete,
}

impl ProtocolEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::LoggedOut { .. } => "logged_out",
            Self::PairSuccess { .. } => "pair_success",
            Self::Qr { .. } => "qr",
            Self::Message(_) => "message",
            Self::Receipt(_) => "receipt",
            Self::Presence(_) => "presence",
            Self::ChatPresence(_) => "chat_presence",
            Self::HistorySync(_) => "history_sync",
            Self::GroupInfo(_) => "group_info",
            Self::Contact(_) => "contact",
            Self::Picture(_) => "picture",
            Self::BusinessName(_) => "business_name",
            Self::KeepAliveTimeout => "keep_alive_timeout",
            Self::KeepAliveRestored => "keep_alive_restored",
            Self::AppStateSyncComplete => "app_state_sync_complete",
        }
    }
}
