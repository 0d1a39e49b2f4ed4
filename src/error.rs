//! Error types for the Bodynodes host

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Bodynodes host error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The identifiers given to `start` do not fit the transport
    #[error("Invalid identifiers: {0}")]
    InvalidIdentifiers(String),

    /// The data socket could not be bound
    #[error("Cannot bind {address}: {source}")]
    Bind {
        /// Address we tried to bind
        address: String,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// RFCOMM channel lookup failed for a device
    #[error("Cannot resolve RFCOMM port for {0}")]
    PortResolution(String),

    /// Device could not be connected
    #[error("Connection to {address} failed: {reason}")]
    Connect {
        /// Device address
        address: String,
        /// Human readable cause
        reason: String,
    },

    /// GATT service or characteristic missing
    #[error("GATT error: {0}")]
    Gatt(String),

    /// Endpoint is not known to the transport
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Malformed payload
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Operation not supported
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),
}
