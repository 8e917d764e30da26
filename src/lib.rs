//! # lamco-selection-sync
//!
//! Clipboard selection synchronization between a local session and a
//! remote peer.
//!
//! This crate integrates:
//! - [`lamco_clipboard_core`] - Target filtering, wire codec, incremental transfers
//! - [`clipboard`] - Selection proxies, the protocol dispatcher and backends
//! - [`config`] - TOML configuration
//!
//! # Architecture
//!
//! ```text
//! lamco-selection-sync
//!   ├─> ClipboardEngine (one dispatcher task per peer)
//!   │     ├─> SelectionProxy per selection (CLIPBOARD, PRIMARY, SECONDARY)
//!   │     └─> RequestTracker (outstanding peer requests, timeouts)
//!   ├─> SelectionBackend (native clipboard driver, in-memory for headless use)
//!   └─> PacketSender (transport to the peer)
//! ```
//!
//! # Data Flow
//!
//! **Outbound:** Native owner change → Proxy → `clipboard-token` → Peer
//!
//! **Inbound:** Peer `clipboard-request` → Proxy → Backend read → `clipboard-contents` → Peer

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Engine configuration
pub mod config;

/// Clipboard synchronization engine
///
/// Connects a native clipboard ([`clipboard::SelectionBackend`]) to a peer
/// speaking the clipboard packet protocol ([`clipboard::Packet`]).
pub mod clipboard;

pub use lamco_clipboard_core;
