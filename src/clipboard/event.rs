//! Events consumed by the engine loop.
//!
//! Everything that can change engine state arrives as an [`EngineEvent`] on a
//! single channel: inbound packets, native notifications, completions of
//! spawned backend calls, timer fires and commands from the engine handle.

use lamco_clipboard_core::TargetData;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

use crate::clipboard::backend::ReadOutcome;
use crate::clipboard::dispatcher::EngineInfo;
use crate::clipboard::error::Result;
use crate::clipboard::packet::{Packet, WireValue};

/// Sender half of the engine event channel
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Receiver half of the engine event channel
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Timer fires. Each carries the id of the task that scheduled it so that
/// fires of cancelled or replaced tasks can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Debounced token emission is due
    EmitToken {
        /// Local selection name
        selection: String,
        /// Scheduled task id
        id: u64,
    },
    /// Outstanding remote request timed out
    RequestTimeout {
        /// Request id
        request_id: u64,
    },
    /// Incremental transfer stalled
    IncrementalTimeout {
        /// Local selection name
        selection: String,
        /// Scheduled task id
        id: u64,
    },
}

/// Commands issued through the engine handle
pub enum EngineCommand {
    /// Emit tokens for these local selections right away
    SendTokens(Vec<String>),
    /// Emit tokens for every selection
    SendAllTokens,
    /// Take native ownership of every selection
    ClaimAll,
    /// Forget everything learned from the peer
    ClientReset,
    /// Change the transfer direction
    SetDirection {
        /// Local contents may be sent to the peer
        can_send: bool,
        /// Peer contents may be written locally
        can_receive: bool,
    },
    /// Change the send and receive size limits (0 disables)
    SetLimits {
        /// Outgoing limit in bytes
        max_send_size: usize,
        /// Incoming limit in bytes
        max_receive_size: usize,
    },
    /// Enable exactly these selections (peer namespace)
    EnableSelections(Vec<String>),
    /// Peer wants a token, with contents, on every owner change
    SetGreedyClient(bool),
    /// Peer wants target lists in tokens
    SetWantTargets(bool),
    /// Targets the peer prefers
    SetPreferredTargets(Vec<String>),
    /// Snapshot of the engine state
    Info(oneshot::Sender<EngineInfo>),
}

impl fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendTokens(selections) => write!(f, "SendTokens({:?})", selections),
            Self::SendAllTokens => write!(f, "SendAllTokens"),
            Self::ClaimAll => write!(f, "ClaimAll"),
            Self::ClientReset => write!(f, "ClientReset"),
            Self::SetDirection { can_send, can_receive } => {
                write!(f, "SetDirection(send={}, receive={})", can_send, can_receive)
            }
            Self::SetLimits {
                max_send_size,
                max_receive_size,
            } => write!(f, "SetLimits(send={}, receive={})", max_send_size, max_receive_size),
            Self::EnableSelections(selections) => write!(f, "EnableSelections({:?})", selections),
            Self::SetGreedyClient(greedy) => write!(f, "SetGreedyClient({})", greedy),
            Self::SetWantTargets(want) => write!(f, "SetWantTargets({})", want),
            Self::SetPreferredTargets(targets) => write!(f, "SetPreferredTargets({:?})", targets),
            Self::Info(_) => write!(f, "Info"),
        }
    }
}

/// Engine events
pub enum EngineEvent {
    /// Packet from the peer
    Packet(Packet),
    /// Positional packet from a byte-level transport
    Wire(Vec<WireValue>),
    /// A native application took ownership of the selection
    OwnerChanged {
        /// Local selection name
        selection: String,
    },
    /// Next chunk of an incremental native read (empty terminates)
    IncrementalChunk {
        /// Local selection name
        selection: String,
        /// Stream the chunk belongs to
        transfer_id: u64,
        /// Type of the chunk
        type_tag: String,
        /// Chunk data
        data: Vec<u8>,
    },
    /// Native target query finished
    TargetsQueried {
        /// Local selection name
        selection: String,
        /// Query the result belongs to
        query_id: u64,
        /// Targets, or the backend failure
        result: Result<Vec<String>>,
    },
    /// Native read finished
    ContentsRead {
        /// Local selection name
        selection: String,
        /// Target that was read
        target: String,
        /// Outcome, or the backend failure
        result: Result<ReadOutcome>,
    },
    /// Native write or claim finished
    BackendDone {
        /// Local selection name
        selection: String,
        /// Operation name, for logging
        operation: &'static str,
        /// Outcome
        result: Result<()>,
    },
    /// A native client wants contents the peer owns
    LocalRequest {
        /// Local selection name
        selection: String,
        /// Requested target
        target: String,
        /// Where the answer goes
        reply: oneshot::Sender<Option<TargetData>>,
    },
    /// Timer fired
    Timer(TimerEvent),
    /// Command from the handle
    Command(EngineCommand),
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Packet(packet) => write!(f, "Packet({})", packet),
            Self::Wire(values) => write!(f, "Wire({} values)", values.len()),
            Self::OwnerChanged { selection } => write!(f, "OwnerChanged({})", selection),
            Self::IncrementalChunk {
                selection,
                transfer_id,
                type_tag,
                data,
            } => write!(
                f,
                "IncrementalChunk({}, #{}, {}, {} bytes)",
                selection,
                transfer_id,
                type_tag,
                data.len()
            ),
            Self::TargetsQueried {
                selection,
                query_id,
                result,
            } => match result {
                Ok(targets) => write!(f, "TargetsQueried({}, #{}, {} targets)", selection, query_id, targets.len()),
                Err(e) => write!(f, "TargetsQueried({}, #{}, error: {})", selection, query_id, e),
            },
            Self::ContentsRead {
                selection,
                target,
                result,
            } => match result {
                Ok(outcome) => write!(f, "ContentsRead({}, {}, {:?})", selection, target, outcome),
                Err(e) => write!(f, "ContentsRead({}, {}, error: {})", selection, target, e),
            },
            Self::BackendDone {
                selection, operation, ..
            } => write!(f, "BackendDone({}, {})", selection, operation),
            Self::LocalRequest { selection, target, .. } => write!(f, "LocalRequest({}, {})", selection, target),
            Self::Timer(timer) => write!(f, "Timer({:?})", timer),
            Self::Command(command) => write!(f, "Command({:?})", command),
        }
    }
}
