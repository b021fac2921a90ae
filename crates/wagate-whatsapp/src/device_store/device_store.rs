//! Device identity persistence, one row per `device_id`.

use async_trait::async_trait;
use wacore::store::error::{db_err, StoreError};
use wacore::store::traits::DeviceStore;
use wacore::store::Device;

use super::DeviceScope;

type Result<T> = wacore::store::error::Result<T>;

#[async_trait]
impl DeviceStore for DeviceScope {
    async fn save(&self, device: &Device) -> Result<()> {
        // Device carries byte arrays that only a binary format round-trips.
        let data =
            bincode::serialize(device).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT OR REPLACE INTO wa_device_info (device_id, data) VALUES (?, ?)")
            .bind(self.device_id)
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Device>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM wa_device_info WHERE device_id = ?")
                .bind(self.device_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        row.map(|(data,)| {
            bincode::deserialize(&data).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn exists(&self) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM wa_device_info WHERE device_id = ?")
                .bind(self.device_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn create(&self) -> Result<i32> {
        // The id was allocated in `wa_devices`; key material arrives via save().
        Ok(self.device_id as i32)
    }
}
