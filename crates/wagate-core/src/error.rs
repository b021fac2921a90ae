use thiserror::Error;

/// Error taxonomy of the session gateway.
///
/// Every kind carries a human-readable message. Callers that face the outside
/// world should use [`GatewayError::code`] and [`GatewayError::public_message`]
/// instead of the `Display` output, which may contain backend details.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Bad session name, proxy, or JID.
    #[error("validation error: {0}")]
    Validation(String),

    /// Session missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Session name already taken.
    #[error("session exists: {0}")]
    SessionExists(String),

    #[error("already connected: {0}")]
    AlreadyConnected(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("qr expired: {0}")]
    QrExpired(String),

    #[error("qr not available: {0}")]
    QrNotAvailable(String),

    #[error("qr generation timeout: {0}")]
    QrGenerationTimeout(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("proxy error: {0}")]
    ProxyError(String),

    /// Another lifecycle operation holds the session.
    #[error("busy: {0}")]
    Busy(String),

    /// Relational backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Credential-store failure.
    #[error("device store error: {0}")]
    DeviceStore(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Catch-all. Should be rare and is always logged where raised.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::SessionExists(_) => "session_exists",
            Self::AlreadyConnected(_) => "already_connected",
            Self::NotConnected(_) => "not_connected",
            Self::QrExpired(_) => "qr_expired",
            Self::QrNotAvailable(_) => "qr_not_available",
            Self::QrGenerationTimeout(_) => "qr_generation_timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::PairingFailed(_) => "pairing_failed",
            Self::ProxyError(_) => "proxy_error",
            Self::Busy(_) => "busy",
            Self::Storage(_) => "storage",
            Self::DeviceStore(_) => "device_store",
            Self::Cancelled(_) => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to hand to an external caller.
    ///
    /// Backend kinds never leak their underlying message.
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) => "session storage is unavailable".to_string(),
            Self::DeviceStore(_) => "device credential store is unavailable".to_string(),
            Self::Internal(_) => "internal gateway error".to_string(),
            Self::Validation(m)
            | Self::NotFound(m)
            | Self::SessionExists(m)
            | Self::AlreadyConnected(m)
            | Self::NotConnected(m)
            | Self::QrExpired(m)
            | Self::QrNotAvailable(m)
            | Self::QrGenerationTimeout(m)
            | Self::ConnectionFailed(m)
            | Self::PairingFailed(m)
            | Self::ProxyError(m)
            | Self::Busy(m)
            | Self::Cancelled(m)
            | Self::Timeout(m) => m.clone(),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_hide_details() {
        let err = GatewayError::Storage("database is locked: /var/lib/x.db".into());
        assert_eq!(err.code(), "storage");
        assert!(!err.public_message().contains("/var/lib"));
    }

    #[test]
    fn test_domain_errors_keep_message() {
        let err = GatewayError::SessionExists("session 'alpha' already exists".into());
        assert_eq!(err.code(), "session_exists");
        assert_eq!(err.public_message(), "session 'alpha' already exists");
    }
}
