//! Core error types.
//!
//! [`CoreError`] covers failures outside the datagram result codes:
//! configuration loading and serialization. Transfer outcomes are reported
//! with [`satlink_models::SatelliteError`].

/// Error type for non-transfer operations of the core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization / deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
