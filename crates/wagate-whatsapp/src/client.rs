//! `ProtocolClient` over one `whatsapp-rust` bot.
//!
//! A bot is built per connect on the device's [`DeviceScope`], so credential
//! reads and writes never cross devices. Connection and pairing progress is
//! reported on the event channel handed in by the container.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wagate_core::error::GatewayError;
use wagate_core::protocol::{DeviceHandle, ProtocolClient, ProtocolEvent, QrEvent};
use wagate_core::session::ProxyConfig;
use wacore_binary::builder::NodeBuilder;
use wacore_binary::jid::{Jid, SERVER_JID};
use wacore_binary::node::NodeContent;
use whatsapp_rust::bot::Bot;
use whatsapp_rust::request::InfoQuery;
use whatsapp_rust::Client;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

use crate::device_store::DeviceScope;
use crate::events::{handle_event, Shared};

/// Capacity of the QR pairing stream.
const QR_BUFFER: usize = 8;

/// How long the peer gets to acknowledge an unlink.
const UNLINK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WhatsAppClient {
    shared: Arc<Shared>,
    device_name: String,
    runner: Mutex<Option<JoinHandle<()>>>,
    /// Library client of the running bot, kept for requests outside events.
    client: Mutex<Option<Arc<Client>>>,
}

impl WhatsAppClient {
    pub(crate) fn new(
        scope: DeviceScope,
        device: DeviceHandle,
        events: mpsc::Sender<ProtocolEvent>,
        device_name: String,
    ) -> Self {
        let shared = Shared {
            scope,
            label: format!("device {}", device.key()),
            connected: AtomicBool::new(false),
            jid: Mutex::new(device.jid().map(str::to_string)),
            qr_tx: Mutex::new(None),
            events,
        };
        Self {
            shared: Arc::new(shared),
            device_name,
            runner: Mutex::new(None),
            client: Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the bot task, if any.
    fn stop(&self) {
        if let Some(handle) = self.runner.lock().take() {
            handle.abort();
        }
        self.client.lock().take();
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    /// Tell the peer to remove this companion device. Needs a live
    /// connection.
    async fn notify_unlink(&self) {
        let Some(jid) = self.device_jid() else {
            return;
        };
        let client = self.client.lock().clone();
        let Some(client) = client.filter(|_| self.is_connected()) else {
            warn!(
                "{}: not connected, peer not notified of logout",
                self.shared.label
            );
            return;
        };
        match unlink_companion(&client, &jid).await {
            Ok(()) => info!("{}: peer unlinked {jid}", self.shared.label),
            Err(e) => warn!("{}: peer unlink failed, wiping locally: {e}", self.shared.label),
        }
    }
}

/// `remove-companion-device` request on the multi-device namespace.
async fn unlink_companion(client: &Client, jid: &str) -> Result<(), GatewayError> {
    let node = NodeBuilder::new("remove-companion-device")
        .attr("jid", jid)
        .attr("reason", "user_initiated")
        .build();
    let query = InfoQuery::set(
        "md",
        Jid::new("", SERVER_JID),
        Some(NodeContent::Nodes(vec![node])),
    )
    .with_timeout(UNLINK_TIMEOUT);
    client
        .send_iq(query)
        .await
        .map(|_| ())
        .map_err(|e| GatewayError::ConnectionFailed(format!("remove-companion-device: {e}")))
}

#[async_trait]
impl ProtocolClient for WhatsAppClient {
    async fn connect(&self) -> Result<(), GatewayError> {
        if self.is_running() {
            return Ok(());
        }

        info!("{}: whatsapp bot building...", self.shared.label);
        let shared = self.shared.clone();
        let mut bot = Bot::builder()
            .with_backend(Arc::new(self.shared.scope.clone()))
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .with_device_props(
                Some(self.device_name.clone()),
                None,
                Some(waproto::whatsapp::device_props::PlatformType::Desktop),
            )
            .on_event(move |event, _client| {
                let shared = shared.clone();
                async move {
                    handle_event(event, &shared).await;
                }
            })
            .build()
            .await
            .map_err(|e| GatewayError::ConnectionFailed(format!("whatsapp bot build failed: {e}")))?;
        *self.client.lock() = Some(bot.client());

        let handle = bot
            .run()
            .await
            .map_err(|e| GatewayError::ConnectionFailed(format!("whatsapp bot run failed: {e}")))?;
        *self.runner.lock() = Some(handle);

        info!("{}: whatsapp bot started", self.shared.label);
        Ok(())
    }

    async fn disconnect(&self) {
        self.stop();
        self.shared.finish_qr(QrEvent::Timeout).await;
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        self.notify_unlink().await;
        self.stop();
        self.shared
            .finish_qr(QrEvent::Error("logged out".into()))
            .await;
        *self.shared.jid.lock() = None;
        self.shared.scope.wipe().await.map_err(|e| {
            GatewayError::DeviceStore(format!("failed to wipe device credentials: {e}"))
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst) && self.is_running()
    }

    fn is_paired(&self) -> bool {
        self.shared.jid.lock().is_some()
    }

    fn device_jid(&self) -> Option<String> {
        self.shared.jid.lock().clone()
    }

    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, GatewayError> {
        if self.is_paired() {
            return Err(GatewayError::Validation(
                "device is already paired, no QR stream".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(QR_BUFFER);
        *self.shared.qr_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn set_proxy(&self, proxy: Option<&ProxyConfig>) -> Result<(), GatewayError> {
        match proxy {
            None => Ok(()),
            Some(proxy) => {
                warn!(
                    "{}: proxy {} requested but the websocket transport dials directly",
                    self.shared.label,
                    proxy.host
                );
                Err(GatewayError::ProxyError(
                    "outbound proxies are not supported by the whatsapp transport".into(),
                ))
            }
        }
    }
}

impl Drop for WhatsAppClient {
    fn drop(&mut self) {
        if let Some(handle) = self.runner.get_mut().take() {
            handle.abort();
        }
    }
}
