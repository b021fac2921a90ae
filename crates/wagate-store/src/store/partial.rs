//! Targeted partial updates. Each is a single `UPDATE` and bumps `updated_at`.

use super::{fmt_ts, SessionRepository};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteQueryResult;
use wagate_core::session::ProxyConfig;

impl SessionRepository {
    /// Flip the connection flag. Connecting also stamps `connected_at` and
    /// `last_seen`, and is refused for a session without a `device_jid`.
    pub async fn update_connection_status(
        &self,
        id: &str,
        connected: bool,
    ) -> Result<(), StoreError> {
        let now = fmt_ts(self.now());
        let result = if connected {
            sqlx::query(
                "UPDATE sessions SET is_connected = 1, connected_at = ?, last_seen = ?, \
                 updated_at = ? WHERE id = ? AND device_jid IS NOT NULL",
            )
            .bind(&now)
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE sessions SET is_connected = 0, updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?
        };

        if result.rows_affected() == 0 {
            if connected && self.exists(id).await? {
                return Err(StoreError::Invalid(format!(
                    "session {id} cannot be connected without a device_jid"
                )));
            }
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_last_seen(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET last_seen = ?, updated_at = ? WHERE id = ?")
            .bind(fmt_ts(t))
            .bind(fmt_ts(self.now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        found(result, id)
    }

    /// Store the current QR code. Both QR columns are always written together.
    pub async fn update_qr(
        &self,
        id: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET qr_code = ?, qr_expires_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(code)
        .bind(fmt_ts(expires_at))
        .bind(fmt_ts(self.now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        found(result, id)
    }

    pub async fn clear_qr(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET qr_code = NULL, qr_expires_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(fmt_ts(self.now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        found(result, id)
    }

    /// Commit a completed pairing: the session becomes paired and connected,
    /// any QR and previous error are cleared.
    pub async fn update_device_jid(&self, id: &str, jid: &str) -> Result<(), StoreError> {
        let now = fmt_ts(self.now());
        let result = sqlx::query(
            "UPDATE sessions SET device_jid = ?, is_connected = 1, connected_at = ?, \
             last_seen = ?, qr_code = NULL, qr_expires_at = NULL, connection_error = NULL, \
             updated_at = ? WHERE id = ?",
        )
        .bind(jid)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        found(result, id)
    }

    pub async fn set_connection_error(
        &self,
        id: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE sessions SET connection_error = ?, updated_at = ? WHERE id = ?")
                .bind(error)
                .bind(fmt_ts(self.now()))
                .bind(id)
                .execute(&self.pool)
                .await?;
        found(result, id)
    }

    /// The peer invalidated the credentials: unpair, disconnect, clear QR,
    /// and record why.
    pub async fn mark_logged_out(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let now = fmt_ts(self.now());
        let result = sqlx::query(
            "UPDATE sessions SET device_jid = NULL, is_connected = 0, qr_code = NULL, \
             qr_expires_at = NULL, connection_error = ?, last_seen = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        found(result, id)
    }

    /// The protocol reported a live connection for a paired session: connect,
    /// stamp `connected_at`/`last_seen`, clear the error and any QR.
    pub async fn mark_connected(&self, id: &str) -> Result<(), StoreError> {
        let now = fmt_ts(self.now());
        let result = sqlx::query(
            "UPDATE sessions SET is_connected = 1, connected_at = ?, last_seen = ?, \
             connection_error = NULL, qr_code = NULL, qr_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND device_jid IS NOT NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.exists(id).await? {
                return Err(StoreError::Invalid(format!(
                    "session {id} cannot be connected without a device_jid"
                )));
            }
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_proxy(
        &self,
        id: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<(), StoreError> {
        let json = proxy
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("proxy_config serialization failed: {e}")))?;
        let result =
            sqlx::query("UPDATE sessions SET proxy_config = ?, updated_at = ? WHERE id = ?")
                .bind(json)
                .bind(fmt_ts(self.now()))
                .bind(id)
                .execute(&self.pool)
                .await?;
        found(result, id)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn found(result: SqliteQueryResult, id: &str) -> Result<(), StoreError> {
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}
