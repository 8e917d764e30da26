//! # lamco-clipboard-core
//!
//! Protocol-agnostic building blocks for clipboard selection synchronization.
//!
//! This crate has no knowledge of transports or native clipboard APIs. It
//! provides the pure pieces that every endpoint needs:
//!
//! - **[`TargetFilter`]** - Drop targets that must never cross the wire
//! - **[`WireCodec`]** - Native selection data ↔ endian-neutral wire payloads,
//!   with the size and compression policy
//! - **[`IncrementalTransfer`]** - Reassembly of chunked native reads
//!
//! ## Quick Start
//!
//! ```rust
//! use lamco_clipboard_core::{PreparedContents, TargetData, WireCodec};
//!
//! let codec = WireCodec::default();
//! match codec.prepare_send("UTF8_STRING", TargetData::text("hello")).unwrap() {
//!     PreparedContents::Ready(contents) => assert!(!contents.compress),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

mod error;
mod transfer;

pub mod targets;
pub mod wire;

pub use error::{ClipboardError, ClipboardResult};
pub use targets::{is_text_target, DenyList, TargetFilter, TARGETS, TEXT_TARGETS};
pub use transfer::{
    ChunkOutcome, IncrementalTransfer, TransferProgress, TransferState, DEFAULT_INCREMENTAL_TIMEOUT_MS,
    DEFAULT_MAX_SIZE,
};
pub use wire::{
    BitFormat, CodecConfig, CompressionDecision, EncodedContents, PreparedContents, SelectionValue, TargetData,
    WireCodec, WireKind, WirePayload, DEFAULT_MAX_PACKET_SIZE, DEFAULT_MIN_COMPRESS_SIZE,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{ClipboardError, ClipboardResult, SelectionValue, TargetData, TargetFilter, WireCodec};
}
