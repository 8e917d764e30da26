//! Clipboard Selection Synchronization
//!
//! Keeps the clipboard selections (`CLIPBOARD`, `PRIMARY`, `SECONDARY`) of
//! a local and a remote session consistent over any packet transport.
//!
//! # Architecture
//!
//! [`lamco_clipboard_core`] provides the pure pieces (target filtering, the
//! wire codec, incremental transfer reassembly). This module adds:
//!
//! - [`SelectionProxy`] - Per-selection token state machine
//! - [`RequestTracker`] - Outstanding requests and their timeouts
//! - [`ClipboardEngine`] - The protocol dispatcher loop and its handle
//! - [`SelectionBackend`] - Contract for native clipboard drivers
//! - [`InMemoryBackend`] - Headless backend
//!
//! # Data Flow
//!
//! ```text
//! Local app               Engine                                      Peer
//! ━━━━━━━━━               ━━━━━━                                      ━━━━
//!
//! Copy
//!   └─> owner changed ──> SelectionProxy ──> clipboard-token ───────────> claims its selection
//!
//!                                                                      Paste
//!       read(target) <─── SelectionProxy <── clipboard-request <──────────┘
//!            └──────────> WireCodec ───────> clipboard-contents ─────────> native client
//! ```
//!
//! # Features
//!
//! - **Token arbitration**: debounced emission, owner-change embargo
//! - **Greedy peers**: contents pushed with the token
//! - **Coalescing**: one native read per target, however many requests wait
//! - **Degradation**: every failure ends as "no data", never a disconnect

pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod memory;
pub mod packet;
pub mod proxy;
pub mod requests;
pub mod timer;
pub mod transport;

pub use lamco_clipboard_core::{
    ClipboardError as CoreClipboardError, CodecConfig, TargetData, TargetFilter, TransferProgress, TransferState,
    WireCodec,
};

pub use backend::{BackendContext, BackendFactory, ChunkStream, NoBackend, ReadOutcome, SelectionBackend};
pub use dispatcher::{ClipboardEngine, EngineConfig, EngineHandle, EngineInfo, NameMap, Progress};
pub use error::{classify_error, recovery_action, ErrorType, RecoveryAction, Result, SyncError};
pub use memory::{InMemoryBackend, InMemoryClipboard};
pub use packet::{Packet, TokenContents, WireValue};
pub use proxy::{choose_targets, ProxyAction, ProxyConfig, ProxyInfo, SelectionProxy};
pub use requests::RequestTracker;
pub use transport::{spawn_forwarder, ChannelSender, ForwardEncoding, PacketSender};
