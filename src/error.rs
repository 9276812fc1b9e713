//! # Error Types
//!
//! Error handling for the sync protocol, its index and its collaborators.
//!
//! Errors fall into four scopes and are handled accordingly:
//! - **Stream/framing errors** (`Io`, `ConnectionClosed`, `InvalidFrame`,
//!   `OversizedField`, `Timeout`): fatal to the current session only
//! - **Indexing errors** (`IndexError`, `WatchError`): scoped to one rule or one
//!   watch registration, the rest of the build proceeds
//! - **Cryptographic errors** (`SigningError`, `KeyError`): signing failures are
//!   reported, verification failures are folded into `false` by the verifier
//! - **Startup errors** (`ConfigError`, `TlsError`, `KeyError`, `Io` on bind):
//!   fatal to the process before serving begins
//!
//! ## Example Usage
//! ```rust
//! use ssproto::error::{ProtocolError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{error, info};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(ProtocolError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents).map_err(ProtocolError::Io)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("ssserver.toml") {
//!         Ok(contents) => info!(contents, "Successfully read file"),
//!         Err(e) => error!(error=%e, "Error reading file"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_DEADLINE_EXCEEDED: &str = "Connection deadline exceeded";

    /// Framing errors
    pub const ERR_INVALID_BOOL: &str = "Boolean field must be 0 or 1";
    pub const ERR_INVALID_UTF8_PATH: &str = "Path field is not valid UTF-8";
    pub const ERR_UNTERMINATED_STRING: &str = "NUL-terminated field exceeds its limit";

    /// Cryptographic errors
    pub const ERR_SIGNING_FAILED: &str = "Unable to sign payload";
    pub const ERR_INVALID_KEY_FILE: &str = "Invalid key file content";
    pub const ERR_KEY_MISMATCH: &str = "Stored public key does not match the private key";
    pub const ERR_INVALID_PUBLIC_KEY: &str = "Invalid public key";
    pub const ERR_SERVER_SIGNATURE: &str = "Invalid identifier signature received from server";
    pub const ERR_PACKET_SIGNATURE: &str = "Delta packet failed hash or signature verification";

    /// Client errors
    pub const ERR_UNSAFE_PATH: &str = "Refusing to write outside the install directory";
    pub const ERR_INVALID_IDENTIFIER: &str = "Stored client identifier has an invalid length";
}

/// ProtocolError is the primary error type for all operations of this crate
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Field {field} too large: {size} bytes (limit {limit})")]
    OversizedField {
        field: &'static str,
        size: u64,
        limit: u64,
    },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Index error: {0}")]
    IndexError(String),

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True for errors that only concern the stream of one session.
    pub fn is_stream_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::InvalidFrame(_)
                | ProtocolError::OversizedField { .. }
                | ProtocolError::Timeout
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::SerializationError(e.to_string())
    }
}

impl From<notify::Error> for ProtocolError {
    fn from(e: notify::Error) -> Self {
        ProtocolError::WatchError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ProtocolError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProtocolError::Custom(format!("Background task failed: {e}"))
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
