//! Device store adapter over the protocol library's device container.

use std::sync::Arc;
use tracing::{info, warn};
use wagate_core::error::GatewayError;
use wagate_core::protocol::{DeviceContainer, DeviceHandle};
use wagate_core::session::parse_jid;

#[derive(Clone)]
pub(crate) struct DeviceAdapter {
    container: Arc<dyn DeviceContainer>,
}

impl DeviceAdapter {
    pub fn new(container: Arc<dyn DeviceContainer>) -> Self {
        Self { container }
    }

    pub fn container(&self) -> &Arc<dyn DeviceContainer> {
        &self.container
    }

    /// Load the device paired as `device_jid`, falling back to a fresh one
    /// when the JID is absent, malformed, or unknown to the store.
    pub async fn get_or_create(
        &self,
        device_jid: Option<&str>,
    ) -> Result<DeviceHandle, GatewayError> {
        let Some(jid) = device_jid.filter(|j| !j.is_empty()) else {
            return self.new_device().await;
        };

        if let Err(e) = parse_jid(jid) {
            warn!("stored device jid unusable ({e}), creating a fresh device");
            return self.new_device().await;
        }

        match self.container.load_device(jid).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) => {
                info!("no stored device for {jid}, creating a fresh device");
                self.new_device().await
            }
            Err(e) => {
                warn!("failed to load device {jid}: {e}; creating a fresh device");
                self.new_device().await
            }
        }
    }

    pub async fn new_device(&self) -> Result<DeviceHandle, GatewayError> {
        self.container.new_device().await.map_err(|e| match e {
            GatewayError::DeviceStore(_) => e,
            other => GatewayError::DeviceStore(other.to_string()),
        })
    }

    /// Drop devices left unpaired by a previous process. Best effort.
    pub async fn purge_unpaired(&self) {
        match self.container.purge_unpaired().await {
            Ok(0) => {}
            Ok(n) => info!("purged {n} unpaired device(s)"),
            Err(e) => warn!("failed to purge unpaired devices: {e}"),
        }
    }

    /// Best-effort credential removal.
    pub async fn delete(&self, device: &DeviceHandle) {
        if let Err(e) = self.container.delete_device(device).await {
            warn!("failed to delete device {}: {e}", device.key());
        }
    }
}
