//! Selection Sync Error Types
//!
//! Errors raised by the synchronization engine, and their classification
//! into the failure classes the engine knows how to degrade from. Nothing
//! here ever tears down the connection: the worst outcome of any runtime
//! error is a paste that does nothing.

use lamco_clipboard_core::ClipboardError;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Engine error types
#[derive(Error, Debug)]
pub enum SyncError {
    /// Error from the core codec, filter or transfer code
    #[error(transparent)]
    Core(#[from] ClipboardError),

    /// Packet type nobody handles
    #[error("Unknown packet type: {0}")]
    UnknownPacket(String),

    /// Packet with missing or mistyped fields
    #[error("Malformed {packet} packet: {reason}")]
    MalformedPacket {
        /// Packet type
        packet: String,
        /// What was wrong
        reason: String,
    },

    /// Selection without a proxy
    #[error("Unknown selection: {0}")]
    UnknownSelection(String),

    /// Native backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Native backend did not answer in time
    #[error("Backend timeout after {0}ms")]
    BackendTimeout(u64),

    /// Payload larger than the packet size limit
    #[error("Payload of {size} bytes exceeds the packet limit of {max} bytes")]
    PacketTooLarge {
        /// Payload size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine task is gone
    #[error("Engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Shorthand for a malformed packet error
    pub fn malformed(packet: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPacket {
            packet: packet.into(),
            reason: reason.into(),
        }
    }
}

/// Error classification for recovery strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Unknown or malformed packets, undecodable payloads
    Protocol,
    /// Native clipboard failures
    Backend,
    /// Size limits
    ResourceExhaustion,
    /// Timeouts and stalled or inconsistent transfers
    Timing,
    /// Invalid configuration, only at startup
    Configuration,
    /// Engine channel closed
    Communication,
}

/// Classify error for recovery strategy selection
pub fn classify_error(error: &SyncError) -> ErrorType {
    match error {
        SyncError::Core(core) => match core {
            ClipboardError::Backend(_) => ErrorType::Backend,
            ClipboardError::InvalidEncoding(_)
            | ClipboardError::UnsupportedBitFormat(_)
            | ClipboardError::UnknownWireKind(_) => ErrorType::Protocol,
            ClipboardError::InvalidFilter { .. } => ErrorType::Configuration,
            ClipboardError::DataSizeExceeded { .. } => ErrorType::ResourceExhaustion,
            ClipboardError::TransferTimeout(_)
            | ClipboardError::TransferCancelled
            | ClipboardError::TransferMismatch(_)
            | ClipboardError::InvalidState(_) => ErrorType::Timing,
        },

        SyncError::UnknownPacket(_) | SyncError::MalformedPacket { .. } | SyncError::UnknownSelection(_) => {
            ErrorType::Protocol
        }

        SyncError::Backend(_) => ErrorType::Backend,

        SyncError::BackendTimeout(_) => ErrorType::Timing,

        SyncError::PacketTooLarge { .. } => ErrorType::ResourceExhaustion,

        SyncError::Config(_) => ErrorType::Configuration,

        SyncError::EngineStopped => ErrorType::Communication,
    }
}

/// Which way the data was travelling when the error happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the peer to the native clipboard
    Inbound,
    /// From the native clipboard to the peer
    Outbound,
}

/// Recovery action to take after error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Log and discard the packet
    DropPacket,
    /// Answer the affected request with "no data"
    AnswerNoData,
    /// Keep the data, cut down to the limit
    Truncate,
    /// Send nothing
    Reject,
    /// Abandon the incremental transfer and free its buffer
    AbortTransfer,
    /// Refuse to start
    FailStartup,
    /// Nothing left to do, the engine is gone
    Stop,
}

/// Determine recovery action for error
pub fn recovery_action(error: &SyncError, direction: Direction) -> RecoveryAction {
    match classify_error(error) {
        ErrorType::Protocol => RecoveryAction::DropPacket,

        ErrorType::Backend => RecoveryAction::AnswerNoData,

        ErrorType::ResourceExhaustion => match direction {
            Direction::Inbound => RecoveryAction::Truncate,
            Direction::Outbound => RecoveryAction::Reject,
        },

        ErrorType::Timing => match error {
            SyncError::Core(ClipboardError::TransferMismatch(_))
            | SyncError::Core(ClipboardError::TransferTimeout(_))
            | SyncError::Core(ClipboardError::TransferCancelled) => RecoveryAction::AbortTransfer,
            _ => RecoveryAction::AnswerNoData,
        },

        ErrorType::Configuration => RecoveryAction::FailStartup,

        ErrorType::Communication => RecoveryAction::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let error = SyncError::UnknownPacket("clipboard-foo".to_string());
        assert_eq!(classify_error(&error), ErrorType::Protocol);

        let error = SyncError::malformed("clipboard-token", "missing selection");
        assert_eq!(classify_error(&error), ErrorType::Protocol);

        let error = SyncError::Core(ClipboardError::UnsupportedBitFormat(24));
        assert_eq!(classify_error(&error), ErrorType::Protocol);

        let error = SyncError::Backend("no display".to_string());
        assert_eq!(classify_error(&error), ErrorType::Backend);

        let error = SyncError::BackendTimeout(1000);
        assert_eq!(classify_error(&error), ErrorType::Timing);

        let error = SyncError::PacketTooLarge { size: 20, max: 10 };
        assert_eq!(classify_error(&error), ErrorType::ResourceExhaustion);

        let error = SyncError::Config("no selections".to_string());
        assert_eq!(classify_error(&error), ErrorType::Configuration);
    }

    #[test]
    fn test_error_display() {
        let error = SyncError::malformed("clipboard-request", "request id is not an integer");
        assert_eq!(
            error.to_string(),
            "Malformed clipboard-request packet: request id is not an integer"
        );

        let error = SyncError::from(ClipboardError::UnknownWireKind("floats".to_string()));
        assert_eq!(error.to_string(), "unknown wire kind: floats");
    }

    #[test]
    fn test_recovery_action_resource_exhaustion() {
        let error = SyncError::PacketTooLarge { size: 20, max: 10 };
        assert_eq!(recovery_action(&error, Direction::Outbound), RecoveryAction::Reject);
        assert_eq!(recovery_action(&error, Direction::Inbound), RecoveryAction::Truncate);
    }

    #[test]
    fn test_recovery_action_transfer() {
        let error = SyncError::Core(ClipboardError::TransferMismatch("type changed".to_string()));
        assert_eq!(
            recovery_action(&error, Direction::Inbound),
            RecoveryAction::AbortTransfer
        );

        let error = SyncError::BackendTimeout(100);
        assert_eq!(
            recovery_action(&error, Direction::Outbound),
            RecoveryAction::AnswerNoData
        );
    }

    #[test]
    fn test_recovery_action_never_disconnects() {
        let runtime_errors = [
            SyncError::UnknownPacket("x".to_string()),
            SyncError::Backend("gone".to_string()),
            SyncError::BackendTimeout(5),
            SyncError::PacketTooLarge { size: 2, max: 1 },
        ];
        for error in &runtime_errors {
            let action = recovery_action(error, Direction::Inbound);
            assert_ne!(action, RecoveryAction::FailStartup);
            assert_ne!(action, RecoveryAction::Stop);
        }
    }
}
