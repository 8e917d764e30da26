//! Error types for clipboard selection operations.

use thiserror::Error;

/// Result type for clipboard operations
pub type ClipboardResult<T> = std::result::Result<T, ClipboardError>;

/// Errors that can occur during clipboard operations
#[derive(Error, Debug)]
pub enum ClipboardError {
    /// Native backend error (X11, Wayland, win32, headless, ...)
    #[error("backend error: {0}")]
    Backend(String),

    /// Wire payload could not be converted to or from raw selection data
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Bit format outside of {8, 16, 32}
    #[error("unsupported bit format: {0}")]
    UnsupportedBitFormat(u32),

    /// Wire kind other than `bytes`, `integers` or `atoms`
    #[error("unknown wire kind: {0}")]
    UnknownWireKind(String),

    /// A filter pattern failed to compile
    #[error("invalid filter pattern '{pattern}': {source}")]
    InvalidFilter {
        /// The offending pattern
        pattern: String,
        /// Compilation error
        #[source]
        source: regex::Error,
    },

    /// Data size exceeded maximum
    #[error("data size {actual} exceeds maximum {max}")]
    DataSizeExceeded {
        /// Actual size in bytes
        actual: usize,
        /// Maximum allowed size in bytes
        max: usize,
    },

    /// Transfer stalled for longer than the inactivity timeout
    #[error("transfer timeout after {0}ms")]
    TransferTimeout(u64),

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// Chunk type or size did not match the announced transfer
    #[error("transfer mismatch: {0}")]
    TransferMismatch(String),

    /// Invalid state for operation
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ClipboardError {
    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Backend(_) | Self::TransferTimeout(_) | Self::TransferCancelled | Self::InvalidState(_)
        )
    }

    /// Returns true if this error indicates an encoding issue
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidEncoding(_) | Self::UnsupportedBitFormat(_) | Self::UnknownWireKind(_)
        )
    }
}
