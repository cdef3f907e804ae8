//! Transport errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FastCGI protocol violation: {0}")]
    Protocol(String),

    #[error("unsupported FastCGI role {0}")]
    UnsupportedRole(u16),

    #[error("connection closed before the request began")]
    Closed,
}

impl TransportError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
