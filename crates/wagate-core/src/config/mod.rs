mod defaults;


use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::GatewayError;
use crate::event::EventKind;
use defaults::*;

/// Top-level wagate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional log file (daily rolling). Stderr logging is always on.
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// Session repository config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// WhatsApp protocol adapter config.
///
/// Credentials of every device live in one SQLite file at `device_db_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default = "default_device_db_path")]
    pub device_db_path: String,
    /// Name shown in the phone's "Linked devices" list.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Print each QR code to the terminal as it arrives.
    #[serde(default)]
    pub print_qr: bool,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            device_db_path: default_device_db_path(),
            device_name: default_device_name(),
            print_qr: false,
        }
    }
}

/// Timers and buffers of the gateway runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Delay before auto-reconnecting previously connected sessions at boot.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_qr_sweep_interval_secs")]
    pub qr_sweep_interval_secs: u64,
    /// Upper bound on `generate_qr` waiting for the first code.
    #[serde(default = "default_qr_wait_timeout_secs")]
    pub qr_wait_timeout_secs: u64,
    #[serde(default = "default_qr_poll_interval_ms")]
    pub qr_poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Lifetime of the first QR code when the library does not supply one.
    #[serde(default = "default_first_qr_timeout_secs")]
    pub first_qr_timeout_secs: u64,
    /// Lifetime of subsequent QR codes when the library does not supply one.
    #[serde(default = "default_next_qr_timeout_secs")]
    pub next_qr_timeout_secs: u64,
    /// Per-session protocol event queue length.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_webhook_buffer")]
    pub webhook_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            qr_sweep_interval_secs: default_qr_sweep_interval_secs(),
            qr_wait_timeout_secs: default_qr_wait_timeout_secs(),
            qr_poll_interval_ms: default_qr_poll_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            first_qr_timeout_secs: default_first_qr_timeout_secs(),
            next_qr_timeout_secs: default_next_qr_timeout_secs(),
            event_buffer: default_event_buffer(),
            webhook_buffer: default_webhook_buffer(),
        }
    }
}

impl RuntimeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
    pub fn qr_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.qr_sweep_interval_secs)
    }
    pub fn qr_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.qr_wait_timeout_secs)
    }
    pub fn qr_poll_interval(&self) -> Duration {
        Duration::from_millis(self.qr_poll_interval_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn first_qr_timeout(&self) -> Duration {
        Duration::from_secs(self.first_qr_timeout_secs)
    }
    pub fn next_qr_timeout(&self) -> Duration {
        Duration::from_secs(self.next_qr_timeout_secs)
    }
}

/// Outbound webhook config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    /// Event kinds to deliver. Empty = all.
    #[serde(default)]
    pub events: Vec<EventKind>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            urls: Vec::new(),
            timeout_secs: default_webhook_timeout_secs(),
            events: Vec::new(),
        }
    }
}

impl WebhookConfig {
    /// Whether envelopes of `kind` should be delivered.
    pub fn accepts(&self, kind: EventKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }
}

/// HTTP adapter config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token for API authentication. Empty = no auth (for local-only use).
    #[serde(default)]
    pub api_key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            api_key: String::new(),
        }
    }
}

impl Config {
    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let rt = &self.runtime;
        let positive = [
            ("runtime.qr_sweep_interval_secs", rt.qr_sweep_interval_secs),
            ("runtime.qr_wait_timeout_secs", rt.qr_wait_timeout_secs),
            ("runtime.qr_poll_interval_ms", rt.qr_poll_interval_ms),
            ("runtime.connect_timeout_secs", rt.connect_timeout_secs),
            ("runtime.first_qr_timeout_secs", rt.first_qr_timeout_secs),
            ("runtime.next_qr_timeout_secs", rt.next_qr_timeout_secs),
            ("webhook.timeout_secs", self.webhook.timeout_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(GatewayError::Validation(format!("{key} must be > 0")));
            }
        }
        if rt.event_buffer == 0 || rt.webhook_buffer == 0 {
            return Err(GatewayError::Validation(
                "runtime buffers must be > 0".to_string(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(GatewayError::Validation(
                "store.max_connections must be > 0".to_string(),
            ));
        }
        if self.webhook.enabled && self.webhook.urls.is_empty() {
            return Err(GatewayError::Validation(
                "webhook is enabled but no urls are configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, GatewayError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Validation(format!("failed to read {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| GatewayError::Validation(format!("failed to parse config: {}", e)))?;

    config.validate()?;
    Ok(config)
}
