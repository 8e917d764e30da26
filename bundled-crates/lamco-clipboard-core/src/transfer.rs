//! Incremental transfer reassembly.
//!
//! Large selection values are delivered by the native owner in chunks: an
//! announcement carrying the total size, then chunks in order, then a
//! zero-length chunk that terminates the transfer. This module only tracks
//! the state; the inactivity timer lives with whoever drives the transfer.

use std::time::Instant;
use tracing::{debug, warn};

use crate::{ClipboardError, ClipboardResult};

/// Inactivity timeout for incremental transfers: 1 second
pub const DEFAULT_INCREMENTAL_TIMEOUT_MS: u64 = 1_000;

/// Largest value accepted through an incremental transfer: 16MB
pub const DEFAULT_MAX_SIZE: usize = 16 * 1024 * 1024;

/// State of a transfer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Announced, no chunk yet
    Pending,
    /// Chunks are arriving
    InProgress,
    /// Terminator received, data delivered
    Completed,
    /// Transfer was cancelled (timeout or owner change)
    Cancelled,
    /// Transfer failed (type change, size mismatch)
    Failed,
}

impl TransferState {
    /// Returns true if the transfer is still active
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Returns true if the transfer has finished (success or failure)
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Progress information for a transfer
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Declared total size
    pub total_bytes: u64,

    /// Bytes received so far
    pub transferred_bytes: u64,

    /// Current transfer state
    pub state: TransferState,

    /// Time of the announcement
    pub started_at: Instant,
}

impl TransferProgress {
    /// Get completion percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Result of feeding a chunk into a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More chunks are expected
    NeedMore,
    /// Terminator received: the reassembled value
    Complete {
        /// Type of the data
        type_tag: String,
        /// The reassembled value, in arrival order
        data: Vec<u8>,
    },
}

/// Reassembles one incremental transfer.
///
/// The first chunk fixes the data type; a chunk of a different type, more
/// data than announced or a short total at termination fails the transfer.
///
/// # Example
///
/// ```rust
/// use lamco_clipboard_core::{ChunkOutcome, IncrementalTransfer};
///
/// let mut transfer = IncrementalTransfer::start("UTF8_STRING", 5, 1024).unwrap();
/// assert_eq!(transfer.push_chunk("UTF8_STRING", b"hel").unwrap(), ChunkOutcome::NeedMore);
/// assert_eq!(transfer.push_chunk("UTF8_STRING", b"lo").unwrap(), ChunkOutcome::NeedMore);
/// match transfer.push_chunk("UTF8_STRING", b"").unwrap() {
///     ChunkOutcome::Complete { data, .. } => assert_eq!(data, b"hello"),
///     ChunkOutcome::NeedMore => unreachable!(),
/// }
/// ```
#[derive(Debug)]
pub struct IncrementalTransfer {
    target: String,
    declared_size: usize,
    type_tag: Option<String>,
    chunks: Vec<Vec<u8>>,
    received: usize,
    state: TransferState,
    started_at: Instant,
}

impl IncrementalTransfer {
    /// Start a transfer of `declared_size` bytes for `target`.
    ///
    /// Fails if the announced size exceeds `max_size` (0 disables the check).
    pub fn start(target: impl Into<String>, declared_size: usize, max_size: usize) -> ClipboardResult<Self> {
        if max_size > 0 && declared_size > max_size {
            return Err(ClipboardError::DataSizeExceeded {
                actual: declared_size,
                max: max_size,
            });
        }
        let target = target.into();
        debug!("incremental transfer of {} bytes for {}", declared_size, target);
        Ok(Self {
            target,
            declared_size,
            type_tag: None,
            chunks: Vec::new(),
            received: 0,
            state: TransferState::Pending,
            started_at: Instant::now(),
        })
    }

    /// Target being transferred
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Current progress
    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            total_bytes: self.declared_size as u64,
            transferred_bytes: self.received as u64,
            state: self.state,
            started_at: self.started_at,
        }
    }

    /// Feed the next chunk. A zero-length chunk terminates the transfer.
    pub fn push_chunk(&mut self, type_tag: &str, chunk: &[u8]) -> ClipboardResult<ChunkOutcome> {
        if !self.state.is_active() {
            return Err(ClipboardError::InvalidState(format!(
                "transfer for {} is {:?}",
                self.target, self.state
            )));
        }

        let type_change = self
            .type_tag
            .as_deref()
            .filter(|expected| *expected != type_tag)
            .map(|expected| format!("data type changed from {} to {}", expected, type_tag));
        if let Some(msg) = type_change {
            return Err(self.fail(msg));
        }
        if self.type_tag.is_none() {
            self.type_tag = Some(type_tag.to_string());
        }

        if chunk.is_empty() {
            if self.received != self.declared_size {
                let msg = format!(
                    "received {} bytes, {} were announced",
                    self.received, self.declared_size
                );
                return Err(self.fail(msg));
            }
            self.state = TransferState::Completed;
            let data = std::mem::take(&mut self.chunks).concat();
            debug!("incremental transfer for {} complete: {} bytes", self.target, data.len());
            return Ok(ChunkOutcome::Complete {
                type_tag: self.type_tag.clone().unwrap_or_default(),
                data,
            });
        }

        if self.received + chunk.len() > self.declared_size {
            let msg = format!(
                "{} bytes overrun the announced {} bytes",
                self.received + chunk.len(),
                self.declared_size
            );
            return Err(self.fail(msg));
        }

        self.received += chunk.len();
        self.chunks.push(chunk.to_vec());
        self.state = TransferState::InProgress;
        Ok(ChunkOutcome::NeedMore)
    }

    /// Abandon the transfer and free its buffer
    pub fn cancel(&mut self) {
        if self.state.is_active() {
            debug!(
                "incremental transfer for {} cancelled after {} of {} bytes",
                self.target, self.received, self.declared_size
            );
            self.state = TransferState::Cancelled;
        }
        self.chunks = Vec::new();
    }

    fn fail(&mut self, msg: String) -> ClipboardError {
        warn!("incremental transfer for {} aborted: {}", self.target, msg);
        self.state = TransferState::Failed;
        self.chunks = Vec::new();
        ClipboardError::TransferMismatch(msg)
    }
}
