//! Identities, Signal sessions, prekeys and sender keys of one device.

use async_trait::async_trait;
use wacore::store::error::db_err;
use wacore::store::traits::SignalStore;

use super::DeviceScope;

type Result<T> = wacore::store::error::Result<T>;

impl DeviceScope {
    async fn fetch_blob(&self, sql: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(sql)
            .bind(self.device_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|(d,)| d))
    }

    async fn exec_keyed(&self, sql: &str, key: &str) -> Result<()> {
        sqlx::query(sql)
            .bind(self.device_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl SignalStore for DeviceScope {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO wa_identities (device_id, address, key_data) VALUES (?, ?, ?)",
        )
        .bind(self.device_id)
        .bind(address)
        .bind(key.as_slice())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_identity(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.fetch_blob(
            "SELECT key_data FROM wa_identities WHERE device_id = ? AND address = ?",
            address,
        )
        .await
    }

    async fn delete_identity(&self, address: &str) -> Result<()> {
        self.exec_keyed(
            "DELETE FROM wa_identities WHERE device_id = ? AND address = ?",
            address,
        )
        .await
    }

    async fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.fetch_blob(
            "SELECT session_data FROM wa_sessions WHERE device_id = ? AND address = ?",
            address,
        )
        .await
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO wa_sessions (device_id, address, session_data) \
             VALUES (?, ?, ?)",
        )
        .bind(self.device_id)
        .bind(address)
        .bind(session)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_session(&self, address: &str) -> Result<()> {
        self.exec_keyed(
            "DELETE FROM wa_sessions WHERE device_id = ? AND address = ?",
            address,
        )
        .await
    }

    async fn store_prekey(&self, id: u32, record: &[u8], uploaded: bool) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO wa_prekeys (device_id, id, record, uploaded) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(self.device_id)
        .bind(i64::from(id))
        .bind(record)
        .bind(uploaded)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT record FROM wa_prekeys WHERE device_id = ? AND id = ?")
                .bind(self.device_id)
                .bind(i64::from(id))
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(d,)| d))
    }

    async fn remove_prekey(&self, id: u32) -> Result<()> {
        sqlx::query("DELETE FROM wa_prekeys WHERE device_id = ? AND id = ?")
            .bind(self.device_id)
            .bind(i64::from(id))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO wa_signed_prekeys (device_id, id, record) VALUES (?, ?, ?)",
        )
        .bind(self.device_id)
        .bind(i64::from(id))
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_signed_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT record FROM wa_signed_prekeys WHERE device_id = ? AND id = ?")
                .bind(self.device_id)
                .bind(i64::from(id))
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(d,)| d))
    }

    async fn load_all_signed_prekeys(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        let rows: Vec<(i64, Vec<u8>)> =
            sqlx::query_as("SELECT id, record FROM wa_signed_prekeys WHERE device_id = ?")
                .bind(self.device_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(rows.into_iter().map(|(id, r)| (id as u32, r)).collect())
    }

    async fn remove_signed_prekey(&self, id: u32) -> Result<()> {
        sqlx::query("DELETE FROM wa_signed_prekeys WHERE device_id = ? AND id = ?")
            .bind(self.device_id)
            .bind(i64::from(id))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO wa_sender_keys (device_id, address, record) VALUES (?, ?, ?)",
        )
        .bind(self.device_id)
        .bind(address)
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_sender_key(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.fetch_blob(
            "SELECT record FROM wa_sender_keys WHERE device_id = ? AND address = ?",
            address,
        )
        .await
    }

    async fn delete_sender_key(&self, address: &str) -> Result<()> {
        self.exec_keyed(
            "DELETE FROM wa_sender_keys WHERE device_id = ? AND address = ?",
            address,
        )
        .await
    }
}
