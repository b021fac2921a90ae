use thiserror::Error;
use wagate_core::error::GatewayError;

/// Repository error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    /// Unique-name constraint violated.
    #[error("session name already taken: {0}")]
    NameConflict(String),

    /// The write would break a session invariant.
    #[error("invalid session state: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Classify a sqlx error, turning unique violations into `NameConflict`.
    pub(crate) fn from_sqlx(e: sqlx::Error, name: &str) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::NameConflict(name.to_string())
            }
            _ => Self::Storage(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => GatewayError::NotFound(format!("session '{id}' not found")),
            StoreError::NameConflict(name) => {
                GatewayError::SessionExists(format!("session '{name}' already exists"))
            }
            StoreError::Invalid(msg) => GatewayError::Validation(msg),
            StoreError::Storage(msg) => GatewayError::Storage(msg),
        }
    }
}
