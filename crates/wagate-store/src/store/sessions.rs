//! Full-row session CRUD, listing, and counting.

use super::{fmt_ts, rows_to_sessions, SessionRepository, SessionRow, SESSION_COLUMNS};
use crate::error::StoreError;
use wagate_core::session::Session;

impl SessionRepository {
    /// Insert a new session row.
    pub async fn create(&self, session: &Session) -> Result<(), StoreError> {
        check_invariants(session)?;
        let proxy = proxy_json(session)?;

        sqlx::query(
            "INSERT INTO sessions \
             (id, name, device_jid, is_connected, connection_error, qr_code, qr_expires_at, \
              proxy_config, created_at, updated_at, connected_at, last_seen) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.device_jid)
        .bind(session.is_connected)
        .bind(&session.connection_error)
        .bind(&session.qr_code)
        .bind(session.qr_expires_at.map(fmt_ts))
        .bind(&proxy)
        .bind(fmt_ts(session.created_at))
        .bind(fmt_ts(session.updated_at))
        .bind(session.connected_at.map(fmt_ts))
        .bind(session.last_seen.map(fmt_ts))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, &session.name))?;

        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Session, StoreError> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .try_into()
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Session, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::NotFound(name.to_string()))?
            .try_into()
    }

    /// Replace every mutable field (all but `id` and `created_at`).
    /// `updated_at` is set to now.
    pub async fn update(&self, session: &Session) -> Result<(), StoreError> {
        check_invariants(session)?;
        let proxy = proxy_json(session)?;

        let result = sqlx::query(
            "UPDATE sessions SET \
             name = ?, device_jid = ?, is_connected = ?, connection_error = ?, qr_code = ?, \
             qr_expires_at = ?, proxy_config = ?, updated_at = ?, connected_at = ?, last_seen = ? \
             WHERE id = ?",
        )
        .bind(&session.name)
        .bind(&session.device_jid)
        .bind(session.is_connected)
        .bind(&session.connection_error)
        .bind(&session.qr_code)
        .bind(session.qr_expires_at.map(fmt_ts))
        .bind(&proxy)
        .bind(fmt_ts(self.now()))
        .bind(session.connected_at.map(fmt_ts))
        .bind(session.last_seen.map(fmt_ts))
        .bind(&session.id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, &session.name))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session.id.clone()));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Page through sessions, newest first.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Session>, StoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows_to_sessions(rows)
    }

    /// Every session, oldest first.
    pub async fn list_all(&self) -> Result<Vec<Session>, StoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows_to_sessions(rows)
    }

    pub async fn list_connected(&self) -> Result<Vec<Session>, StoreError> {
        self.list_by_status(true).await
    }

    /// Sessions with the given connection flag, most recently updated first.
    pub async fn list_by_status(&self, connected: bool) -> Result<Vec<Session>, StoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE is_connected = ? \
             ORDER BY updated_at DESC"
        ))
        .bind(connected)
        .fetch_all(&self.pool)
        .await?;
        rows_to_sessions(rows)
    }

    pub async fn exists_by_name(&self, name: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_connected(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE is_connected = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Reject rows that would break the connected/paired and QR-pair invariants.
fn check_invariants(session: &Session) -> Result<(), StoreError> {
    if session.is_connected && session.device_jid.is_none() {
        return Err(StoreError::Invalid(format!(
            "session {} cannot be connected without a device_jid",
            session.id
        )));
    }
    if session.qr_code.is_some() != session.qr_expires_at.is_some() {
        return Err(StoreError::Invalid(format!(
            "session {}: qr_code and qr_expires_at must be set together",
            session.id
        )));
    }
    Ok(())
}

fn proxy_json(session: &Session) -> Result<Option<String>, StoreError> {
    session
        .proxy_config
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Storage(format!("proxy_config serialization failed: {e}")))
}
