//! SQLite-backed session repository.
//!
//! Split into focused submodules:
//! - `sessions`: full-row CRUD, listing, and counting
//! - `partial`: targeted partial updates used on the hot path (QR refresh,
//!   status changes) so they never race a read-modify-write
//!
//! Every method is a plain future: dropping it cancels the in-flight query,
//! which is how callers' cancellation reaches the store.

mod partial;
mod sessions;

use crate::error::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;
use wagate_core::clock::SharedClock;
use wagate_core::config::StoreConfig;
use wagate_core::session::{ProxyConfig, Session};
use wagate_core::shellexpand;

/// Column list shared by every `SELECT` on `sessions`.
const SESSION_COLUMNS: &str = "id, name, device_jid, is_connected, connection_error, qr_code, \
     qr_expires_at, proxy_config, created_at, updated_at, connected_at, last_seen";

/// Durable session store.
#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
    clock: SharedClock,
}

impl SessionRepository {
    /// Open (or create) the database and run migrations.
    pub async fn new(config: &StoreConfig, clock: SharedClock) -> Result<Self, StoreError> {
        let db_path = shellexpand(&config.db_path);

        // Ensure parent directory exists.
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| StoreError::Storage(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::Storage(format!("failed to connect to sqlite: {e}")))?;

        let repo = Self::from_pool(pool, clock).await?;
        info!("Session repository initialized at {db_path}");
        Ok(repo)
    }

    /// Wrap an existing pool, running migrations on it.
    pub async fn from_pool(pool: SqlitePool, clock: SharedClock) -> Result<Self, StoreError> {
        Self::run_migrations(&pool).await?;
        Ok(Self { pool, clock })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| StoreError::Storage(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] = &[(
            "001_sessions",
            include_str!("../../migrations/001_sessions.sql"),
        )];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        StoreError::Storage(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| StoreError::Storage(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| {
                    StoreError::Storage(format!("failed to record migration {name}: {e}"))
                })?;
        }
        Ok(())
    }
}

/// Raw `sessions` row.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    name: String,
    device_jid: Option<String>,
    is_connected: bool,
    connection_error: Option<String>,
    qr_code: Option<String>,
    qr_expires_at: Option<String>,
    proxy_config: Option<String>,
    created_at: String,
    updated_at: String,
    connected_at: Option<String>,
    last_seen: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let proxy_config = row
            .proxy_config
            .as_deref()
            .map(serde_json::from_str::<ProxyConfig>)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("bad proxy_config for {}: {e}", row.id)))?;

        Ok(Session {
            qr_expires_at: parse_opt_ts(row.qr_expires_at.as_deref())?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            connected_at: parse_opt_ts(row.connected_at.as_deref())?,
            last_seen: parse_opt_ts(row.last_seen.as_deref())?,
            id: row.id,
            name: row.name,
            device_jid: row.device_jid,
            is_connected: row.is_connected,
            connection_error: row.connection_error,
            qr_code: row.qr_code,
            proxy_config,
        })
    }
}

/// Fixed-width RFC 3339, so text order is time order.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Storage(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(parse_ts).transpose()
}

fn rows_to_sessions(rows: Vec<SessionRow>) -> Result<Vec<Session>, StoreError> {
    rows.into_iter().map(Session::try_from).collect()
}
