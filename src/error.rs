//! Error types for the boardwatch daemon.

use thiserror::Error;

use crate::protocol::ResponseCode;

/// The main error type for boardwatch operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The serial port could not be opened within the configured budget.
    #[error("could not open {port} after {attempts} attempts")]
    OpenExhausted { port: String, attempts: u32 },

    /// Request sent but no complete frame arrived before the deadline.
    #[error("no response after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A response arrived whose checksum did not match its contents.
    #[error("checksum mismatch in response 0x{command:02x}")]
    ChecksumMismatch { command: u8 },

    /// A valid response arrived but for a different command.
    #[error("expected {expected:?}, device answered 0x{got:02x}")]
    UnexpectedResponse { expected: ResponseCode, got: u8 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration value rejected.
    #[error("invalid config: {message}")]
    Config { message: String },

    /// An external program (ping, shutdown, hand-off) failed to run.
    #[error("{program} failed: {reason}")]
    Command { program: String, reason: String },
}

/// Frame-specific errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Parameter block exceeds the protocol maximum.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Frame body could not be unescaped or split.
    #[error("malformed frame: {reason}")]
    Malformed { reason: &'static str },
}

impl Error {
    pub(crate) fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns true if the error came from the serial link itself rather than
    /// from the device's answer.
    #[must_use]
    pub const fn is_link_failure(&self) -> bool {
        matches!(self, Self::Serial(_) | Self::Io(_) | Self::NotConnected)
    }
}

/// Result type alias for boardwatch operations.
pub type Result<T> = std::result::Result<T, Error>;
