//! Default values for serde `#[serde(default = ...)]` attributes.

pub(super) fn default_true() -> bool {
    true
}
pub(super) fn default_data_dir() -> String {
    "~/.wagate".to_string()
}
pub(super) fn default_log_level() -> String {
    "info".to_string()
}
pub(super) fn default_db_path() -> String {
    "~/.wagate/data/sessions.db".to_string()
}
pub(super) fn default_max_connections() -> u32 {
    4
}
pub(super) fn default_device_db_path() -> String {
    "~/.wagate/data/devices.db".to_string()
}
pub(super) fn default_device_name() -> String {
    "WAGATE".to_string()
}
pub(super) fn default_reconnect_delay_ms() -> u64 {
    2000
}
pub(super) fn default_qr_sweep_interval_secs() -> u64 {
    60
}
pub(super) fn default_qr_wait_timeout_secs() -> u64 {
    10
}
pub(super) fn default_qr_poll_interval_ms() -> u64 {
    50
}
pub(super) fn default_connect_timeout_secs() -> u64 {
    30
}
pub(super) fn default_first_qr_timeout_secs() -> u64 {
    60
}
pub(super) fn default_next_qr_timeout_secs() -> u64 {
    20
}
pub(super) fn default_event_buffer() -> usize {
    256
}
pub(super) fn default_webhook_buffer() -> usize {
    1024
}
pub(super) fn default_webhook_timeout_secs() -> u64 {
    10
}
pub(super) fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
pub(super) fn default_api_port() -> u16 {
    8080
}
