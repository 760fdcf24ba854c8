//! Error types for the feeder client.

use thiserror::Error;

/// Feeder client errors.
///
/// None of these reach the accessory bridge; the client logs them and
/// falls back to the reconnect policy or to stale telemetry.
#[derive(Error, Debug)]
pub enum FeederError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not open the socket to the device endpoint
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Frame builder was handed something that is not even-length hex
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,

    /// No authorization code could be obtained
    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

/// Convenient Result type for feeder operations.
pub type FeederResult<T> = Result<T, FeederError>;
