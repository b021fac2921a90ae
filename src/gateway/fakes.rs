//! In-memory `DeviceContainer` / `ProtocolClient` used by the gateway and
//! HTTP adapter tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use wagate_core::error::GatewayError;
use wagate_core::protocol::{
    DeviceContainer, DeviceHandle, ProtocolClient, ProtocolEvent, QrEvent,
};
use wagate_core::session::ProxyConfig;

/// device key → paired JID.
type Devices = Arc<Mutex<HashMap<i64, Option<String>>>>;

#[derive(Default)]
pub struct FakeContainer {
    next_key: AtomicI64,
    devices: Devices,
    clients: Mutex<HashMap<i64, Arc<FakeClient>>>,
    pub fail_connect: AtomicBool,
    pub refuse_proxy: AtomicBool,
}

impl FakeContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The latest client built on device `key`.
    pub fn client(&self, key: i64) -> Option<Arc<FakeClient>> {
        self.clients.lock().get(&key).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn has_device_for(&self, jid: &str) -> bool {
        self.devices
            .lock()
            .values()
            .any(|j| j.as_deref() == Some(jid))
    }
}

#[async_trait]
impl DeviceContainer for FakeContainer {
    async fn load_device(&self, jid: &str) -> Result<Option<DeviceHandle>, GatewayError> {
        let devices = self.devices.lock();
        Ok(devices
            .iter()
            .find(|(_, j)| j.as_deref() == Some(jid))
            .map(|(key, j)| DeviceHandle::new(*key, j.clone())))
    }

    async fn new_device(&self) -> Result<DeviceHandle, GatewayError> {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst) + 1;
        self.devices.lock().insert(key, None);
        Ok(DeviceHandle::new(key, None))
    }

    async fn delete_device(&self, device: &DeviceHandle) -> Result<(), GatewayError> {
        self.devices.lock().remove(&device.key());
        Ok(())
    }

    async fn purge_unpaired(&self) -> Result<usize, GatewayError> {
        let mut devices = self.devices.lock();
        let before = devices.len();
        devices.retain(|_, jid| jid.is_some());
        Ok(before - devices.len())
    }

    async fn new_client(
        &self,
        device: DeviceHandle,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolClient>, GatewayError> {
        let client = Arc::new(FakeClient {
            key: device.key(),
            devices: self.devices.clone(),
            events,
            qr_tx: Mutex::new(None),
            connected: AtomicBool::new(false),
            fail_connect: self.fail_connect.load(Ordering::SeqCst),
            refuse_proxy: self.refuse_proxy.load(Ordering::SeqCst),
            connects: AtomicUsize::new(0),
            qr_channels: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
        });
        self.clients.lock().insert(device.key(), client.clone());
        Ok(client)
    }
}

pub struct FakeClient {
    key: i64,
    devices: Devices,
    events: mpsc::Sender<ProtocolEvent>,
    qr_tx: Mutex<Option<mpsc::Sender<QrEvent>>>,
    connected: AtomicBool,
    fail_connect: bool,
    refuse_proxy: bool,
    pub connects: AtomicUsize,
    pub qr_channels: AtomicUsize,
    pub logouts: AtomicUsize,
}

impl FakeClient {
    pub fn key(&self) -> i64 {
        self.key
    }

    fn jid(&self) -> Option<String> {
        self.devices.lock().get(&self.key).cloned().flatten()
    }

    /// Push a QR code with no explicit lifetime.
    pub async fn emit_qr(&self, code: &str) {
        let tx = self.qr_tx.lock().clone();
        tx.expect("no QR subscriber")
            .send(QrEvent::Code {
                code: code.to_string(),
                timeout: None,
            })
            .await
            .unwrap();
    }

    /// Push any event onto the QR stream.
    pub async fn emit_qr_event(&self, event: QrEvent) {
        let tx = self.qr_tx.lock().clone();
        tx.expect("no QR subscriber").send(event).await.unwrap();
    }

    /// Close the QR stream without a terminal event.
    pub fn close_qr(&self) {
        self.qr_tx.lock().take();
    }

    /// Complete pairing as the library does: QR success, then pair success,
    /// then connected.
    pub async fn pair(&self, jid: &str) {
        self.devices.lock().insert(self.key, Some(jid.to_string()));
        let tx = self.qr_tx.lock().take();
        if let Some(tx) = tx {
            tx.send(QrEvent::Success).await.unwrap();
        }
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ProtocolEvent::PairSuccess {
            jid: jid.to_string(),
        })
        .await;
        self.emit(ProtocolEvent::Connected).await;
    }

    pub async fn emit(&self, event: ProtocolEvent) {
        self.events.send(event).await.unwrap();
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(GatewayError::ConnectionFailed("peer unreachable".into()));
        }
        if self.jid().is_some() {
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.events.send(ProtocolEvent::Connected).await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.qr_tx.lock().take();
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.devices.lock().insert(self.key, None);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_paired(&self) -> bool {
        self.jid().is_some()
    }

    fn device_jid(&self) -> Option<String> {
        self.jid()
    }

    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, GatewayError> {
        if self.is_paired() {
            return Err(GatewayError::Validation("device already paired".into()));
        }
        let (tx, rx) = mpsc::channel(8);
        *self.qr_tx.lock() = Some(tx);
        self.qr_channels.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn set_proxy(&self, _proxy: Option<&ProxyConfig>) -> Result<(), GatewayError> {
        if self.refuse_proxy {
            return Err(GatewayError::ProxyError("proxy unreachable".into()));
        }
        Ok(())
    }
}
