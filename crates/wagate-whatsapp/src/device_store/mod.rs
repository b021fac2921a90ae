//! SQLx-based multi-device storage backend for `whatsapp-rust`.
//!
//! One SQLite database holds the credentials of every device the gateway
//! owns. `wa_devices` allocates device ids and remembers the JID each device
//! paired as; every other table is keyed by `device_id`, and a
//! [`DeviceScope`] implements the `Backend` traits (SignalStore +
//! AppSyncStore + ProtocolStore + DeviceStore) for exactly one device.

mod app_sync_store;
mod device_store;
mod protocol_store;
mod signal_store;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use wagate_core::config::WhatsAppConfig;
use wagate_core::error::GatewayError;
use wagate_core::protocol::{DeviceContainer, DeviceHandle, ProtocolClient, ProtocolEvent};
use wagate_core::session::parse_jid;
use wagate_core::shellexpand;

use crate::client::WhatsAppClient;

/// Tables that hold per-device credential rows.
const DEVICE_TABLES: &[&str] = &[
    "wa_identities",
    "wa_sessions",
    "wa_prekeys",
    "wa_signed_prekeys",
    "wa_sender_keys",
    "wa_app_sync_keys",
    "wa_app_versions",
    "wa_mutation_macs",
    "wa_skdm_recipients",
    "wa_lid_mappings",
    "wa_base_keys",
    "wa_device_lists",
    "wa_forget_sender_keys",
    "wa_device_info",
];

/// Store access for one device.
#[derive(Clone)]
pub struct DeviceScope {
    pool: SqlitePool,
    device_id: i64,
}

impl DeviceScope {
    pub(crate) fn new(pool: SqlitePool, device_id: i64) -> Self {
        Self { pool, device_id }
    }

    /// Remember the JID this device paired as.
    pub(crate) async fn bind_jid(&self, jid: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE wa_devices SET jid = ? WHERE id = ?")
            .bind(jid)
            .bind(self.device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete every credential row of this device, keeping the id allocated.
    pub(crate) async fn wipe(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for table in DEVICE_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE device_id = ?"))
                .bind(self.device_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE wa_devices SET jid = NULL WHERE id = ?")
            .bind(self.device_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// The device registry shared by every session.
#[derive(Clone)]
pub struct SqlxDeviceContainer {
    pool: SqlitePool,
    device_name: String,
}

impl SqlxDeviceContainer {
    /// Open the device database at `config.device_db_path`.
    pub async fn new(config: &WhatsAppConfig) -> Result<Self, GatewayError> {
        let db_path = shellexpand(&config.device_db_path);
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::DeviceStore(format!("failed to create device dir: {e}"))
            })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| GatewayError::DeviceStore(format!("invalid device db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| GatewayError::DeviceStore(format!("device store init failed: {e}")))?;

        let container = Self::from_pool(pool, &config.device_name).await?;
        info!("Device store initialized at {db_path}");
        Ok(container)
    }

    /// Wrap an existing pool and create the schema.
    pub async fn from_pool(pool: SqlitePool, device_name: &str) -> Result<Self, GatewayError> {
        init_schema(&pool)
            .await
            .map_err(|e| GatewayError::DeviceStore(format!("device schema init failed: {e}")))?;
        Ok(Self {
            pool,
            device_name: device_name.to_string(),
        })
    }

    fn scope(&self, device: &DeviceHandle) -> DeviceScope {
        DeviceScope::new(self.pool.clone(), device.key())
    }
}

#[async_trait]
impl DeviceContainer for SqlxDeviceContainer {
    async fn load_device(&self, jid: &str) -> Result<Option<DeviceHandle>, GatewayError> {
        parse_jid(jid)?;
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT d.id FROM wa_devices d \
             JOIN wa_device_info i ON i.device_id = d.id WHERE d.jid = ?",
        )
        .bind(jid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::DeviceStore(format!("device lookup failed: {e}")))?;
        Ok(row.map(|(id,)| DeviceHandle::new(id, Some(jid.to_string()))))
    }

    async fn new_device(&self) -> Result<DeviceHandle, GatewayError> {
        let result = sqlx::query("INSERT INTO wa_devices (jid) VALUES (NULL)")
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::DeviceStore(format!("device allocation failed: {e}")))?;
        Ok(DeviceHandle::new(result.last_insert_rowid(), None))
    }

    async fn delete_device(&self, device: &DeviceHandle) -> Result<(), GatewayError> {
        self.scope(device)
            .wipe()
            .await
            .map_err(|e| GatewayError::DeviceStore(format!("device wipe failed: {e}")))?;
        sqlx::query("DELETE FROM wa_devices WHERE id = ?")
            .bind(device.key())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::DeviceStore(format!("device delete failed: {e}")))?;
        Ok(())
    }

    async fn purge_unpaired(&self) -> Result<usize, GatewayError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM wa_devices WHERE jid IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::DeviceStore(format!("device scan failed: {e}")))?;
        for (id,) in &rows {
            self.delete_device(&DeviceHandle::new(*id, None)).await?;
        }
        Ok(rows.len())
    }

    async fn new_client(
        &self,
        device: DeviceHandle,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolClient>, GatewayError> {
        let scope = self.scope(&device);
        Ok(Arc::new(WhatsAppClient::new(
            scope,
            device,
            events,
            self.device_name.clone(),
        )))
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS wa_devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            jid TEXT UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE TABLE IF NOT EXISTS wa_identities (
            device_id INTEGER NOT NULL,
            address TEXT NOT NULL,
            key_data BLOB NOT NULL,
            PRIMARY KEY (device_id, address)
        );
        CREATE TABLE IF NOT EXISTS wa_sessions (
            device_id INTEGER NOT NULL,
            address TEXT NOT NULL,
            session_data BLOB NOT NULL,
            PRIMARY KEY (device_id, address)
        );
        CREATE TABLE IF NOT EXISTS wa_prekeys (
            device_id INTEGER NOT NULL,
            id INTEGER NOT NULL,
            record BLOB NOT NULL,
            uploaded INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (device_id, id)
        );
        CREATE TABLE IF NOT EXISTS wa_signed_prekeys (
            device_id INTEGER NOT NULL,
            id INTEGER NOT NULL,
            record BLOB NOT NULL,
            PRIMARY KEY (device_id, id)
        );
        CREATE TABLE IF NOT EXISTS wa_sender_keys (
            device_id INTEGER NOT NULL,
            address TEXT NOT NULL,
            record BLOB NOT NULL,
            PRIMARY KEY (device_id, address)
        );
        CREATE TABLE IF NOT EXISTS wa_app_sync_keys (
            device_id INTEGER NOT NULL,
            key_id BLOB NOT NULL,
            key_data BLOB NOT NULL,
            timestamp INTEGER NOT NULL DEFAULT 0,
            fingerprint BLOB,
            PRIMARY KEY (device_id, key_id)
        );
        CREATE TABLE IF NOT EXISTS wa_app_versions (
            device_id INTEGER NOT NULL,
            collection TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (device_id, collection)
        );
        CREATE TABLE IF NOT EXISTS wa_mutation_macs (
            device_id INTEGER NOT NULL,
            collection TEXT NOT NULL,
            index_mac BLOB NOT NULL,
            version INTEGER NOT NULL,
            value_mac BLOB NOT NULL,
            PRIMARY KEY (device_id, collection, index_mac)
        );
        CREATE TABLE IF NOT EXISTS wa_skdm_recipients (
            device_id INTEGER NOT NULL,
            group_jid TEXT NOT NULL,
            device_jid TEXT NOT NULL,
            PRIMARY KEY (device_id, group_jid, device_jid)
        );
        CREATE TABLE IF NOT EXISTS wa_lid_mappings (
            device_id INTEGER NOT NULL,
            lid TEXT NOT NULL,
            phone_number TEXT NOT NULL,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0,
            learning_source TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (device_id, lid)
        );
        CREATE TABLE IF NOT EXISTS wa_base_keys (
            device_id INTEGER NOT NULL,
            address TEXT NOT NULL,
            message_id TEXT NOT NULL,
            base_key BLOB NOT NULL,
            PRIMARY KEY (device_id, address, message_id)
        );
        CREATE TABLE IF NOT EXISTS wa_device_lists (
            device_id INTEGER NOT NULL,
            user TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (device_id, user)
        );
        CREATE TABLE IF NOT EXISTS wa_forget_sender_keys (
            device_id INTEGER NOT NULL,
            group_jid TEXT NOT NULL,
            participant TEXT NOT NULL,
            PRIMARY KEY (device_id, group_jid, participant)
        );
        CREATE TABLE IF NOT EXISTS wa_device_info (
            device_id INTEGER PRIMARY KEY,
            data BLOB NOT NULL
        );",
    )
    .execute(pool)
    .await?;
    Ok(())
}
