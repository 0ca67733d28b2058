//! Error types for bootlink

use thiserror::Error;

/// Main error type for device transports and discovery
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Bluetooth error: {0}")]
    BluetoothError(String),

    /// The underlying channel could not be established
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Not connected to a device")]
    NotConnected,

    /// No reply arrived within the wait window
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The device answered with `{"type": "error"}`
    #[error("Device reported an error: {0}")]
    DeviceError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        LinkError::BluetoothError(err.to_string())
    }
}

impl LinkError {
    /// True for errors caused by the wait window elapsing
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Timeout(_))
    }
}
