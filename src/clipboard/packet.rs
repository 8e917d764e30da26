//! Clipboard protocol packets.
//!
//! The packet set is closed: every packet the engine sends or accepts is a
//! [`Packet`] variant. Byte-level transports that only know loosely typed
//! positional values go through [`Packet::to_wire`] and [`Packet::from_wire`].
//!
//! Field order on the wire:
//!
//! | Packet                        | Fields                                                                     |
//! |-------------------------------|----------------------------------------------------------------------------|
//! | `clipboard-token`             | selection, targets, target, type, format, kind, payload, claim, greedy, synchronous |
//! | `clipboard-request`           | request_id, selection, target                                              |
//! | `clipboard-contents`          | request_id, selection, type, format, kind, payload, truncated              |
//! | `clipboard-contents-none`     | request_id, selection                                                      |
//! | `clipboard-pending-requests`  | pending                                                                    |
//! | `clipboard-enable-selections` | selections                                                                 |

use lamco_clipboard_core::{WireKind, WirePayload};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clipboard::error::{Result, SyncError};

/// `clipboard-token` packet type
pub const TOKEN: &str = "clipboard-token";
/// `clipboard-request` packet type
pub const REQUEST: &str = "clipboard-request";
/// `clipboard-contents` packet type
pub const CONTENTS: &str = "clipboard-contents";
/// `clipboard-contents-none` packet type
pub const CONTENTS_NONE: &str = "clipboard-contents-none";
/// `clipboard-pending-requests` packet type
pub const PENDING_REQUESTS: &str = "clipboard-pending-requests";
/// `clipboard-enable-selections` packet type
pub const ENABLE_SELECTIONS: &str = "clipboard-enable-selections";

/// Loosely typed value, as carried by a generic packet transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireValue {
    /// Absent optional field
    None,
    /// Boolean
    Bool(bool),
    /// Unsigned integer
    Int(u64),
    /// String
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Raw bytes the transport should compress
    Compressible(Vec<u8>),
    /// Sequence
    List(Vec<WireValue>),
}

/// Selection contents carried inline in a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenContents {
    /// Target the contents were read for
    pub target: String,
    /// Type of the data
    pub type_tag: String,
    /// Bit format (8, 16 or 32)
    pub bit_format: u8,
    /// Encoded payload
    pub payload: WirePayload,
    /// Transport should compress the payload
    pub compress: bool,
}

/// Clipboard protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Selection ownership moved to the sender
    Token {
        /// Selection name, in the receiver's namespace
        selection: String,
        /// Targets offered by the new owner
        targets: Option<Vec<String>>,
        /// Contents sent ahead of any request
        contents: Option<TokenContents>,
        /// Receiver should claim the native selection
        claim: bool,
        /// Sender wants a token on every owner change
        greedy: Option<bool>,
        /// Sender wants text pushed to its native clipboard immediately
        synchronous: bool,
    },
    /// Ask the peer for selection contents
    Request {
        /// Id allocated by the requester
        request_id: u64,
        /// Selection name
        selection: String,
        /// Requested target
        target: String,
    },
    /// Answer to a request
    Contents {
        /// Id of the request being answered
        request_id: u64,
        /// Selection name
        selection: String,
        /// Type of the data
        type_tag: String,
        /// Bit format (8, 16 or 32)
        bit_format: u8,
        /// Encoded payload
        payload: WirePayload,
        /// Transport should compress the payload
        compress: bool,
        /// Bytes dropped by the sender's size limit
        truncated: u32,
    },
    /// Negative answer to a request
    ContentsNone {
        /// Id of the request being answered
        request_id: u64,
        /// Selection name
        selection: String,
    },
    /// Number of requests the sender is waiting on
    PendingRequests(u8),
    /// Selections the sender wants synchronized
    EnableSelections(Vec<String>),
}

impl Packet {
    /// Packet type name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Token { .. } => TOKEN,
            Self::Request { .. } => REQUEST,
            Self::Contents { .. } => CONTENTS,
            Self::ContentsNone { .. } => CONTENTS_NONE,
            Self::PendingRequests(_) => PENDING_REQUESTS,
            Self::EnableSelections(_) => ENABLE_SELECTIONS,
        }
    }

    /// Token without inline contents
    pub fn token(selection: impl Into<String>, targets: Option<Vec<String>>) -> Self {
        Self::Token {
            selection: selection.into(),
            targets,
            contents: None,
            claim: true,
            greedy: Some(false),
            synchronous: false,
        }
    }

    /// Positional representation, packet type first
    pub fn to_wire(&self) -> Vec<WireValue> {
        let mut out = vec![WireValue::Str(self.name().to_string())];
        match self {
            Self::Token {
                selection,
                targets,
                contents,
                claim,
                greedy,
                synchronous,
            } => {
                out.push(WireValue::Str(selection.clone()));
                out.push(match targets {
                    Some(targets) => string_list(targets),
                    None => WireValue::None,
                });
                match contents {
                    Some(c) => {
                        out.push(WireValue::Str(c.target.clone()));
                        out.push(WireValue::Str(c.type_tag.clone()));
                        out.push(WireValue::Int(c.bit_format as u64));
                        out.push(WireValue::Str(c.payload.kind().as_str().to_string()));
                        out.push(payload_to_wire(&c.payload, c.compress));
                    }
                    None => out.extend(std::iter::repeat(WireValue::None).take(5)),
                }
                out.push(WireValue::Bool(*claim));
                out.push(WireValue::Bool(greedy.unwrap_or(false)));
                out.push(WireValue::Bool(*synchronous));
            }
            Self::Request {
                request_id,
                selection,
                target,
            } => {
                out.push(WireValue::Int(*request_id));
                out.push(WireValue::Str(selection.clone()));
                out.push(WireValue::Str(target.clone()));
            }
            Self::Contents {
                request_id,
                selection,
                type_tag,
                bit_format,
                payload,
                compress,
                truncated,
            } => {
                out.push(WireValue::Int(*request_id));
                out.push(WireValue::Str(selection.clone()));
                out.push(WireValue::Str(type_tag.clone()));
                out.push(WireValue::Int(*bit_format as u64));
                out.push(WireValue::Str(payload.kind().as_str().to_string()));
                out.push(payload_to_wire(payload, *compress));
                out.push(WireValue::Int(*truncated as u64));
            }
            Self::ContentsNone { request_id, selection } => {
                out.push(WireValue::Int(*request_id));
                out.push(WireValue::Str(selection.clone()));
            }
            Self::PendingRequests(count) => out.push(WireValue::Int(*count as u64)),
            Self::EnableSelections(selections) => out.push(string_list(selections)),
        }
        out
    }

    /// Parse a positional packet.
    ///
    /// Trailing optional fields may be missing; older peers omit `claim`,
    /// `greedy`, `synchronous` and `truncated`.
    pub fn from_wire(values: Vec<WireValue>) -> Result<Self> {
        let fields = Fields::new(values)?;
        let packet = match fields.name.as_str() {
            TOKEN => {
                let selection = fields.string(1, "selection")?;
                let targets = match fields.get(2) {
                    None | Some(WireValue::None) => None,
                    Some(_) => Some(fields.string_list(2, "targets")?),
                };
                let contents = match fields.get(3) {
                    None | Some(WireValue::None) => None,
                    Some(_) => {
                        let bit_format = fields.u8(5, "format")?;
                        let kind = WireKind::parse(&fields.string(6, "wire kind")?)?;
                        let (payload, compress) = fields.payload(7, kind)?;
                        Some(TokenContents {
                            target: fields.string(3, "target")?,
                            type_tag: fields.string(4, "type")?,
                            bit_format,
                            payload,
                            compress,
                        })
                    }
                };
                Self::Token {
                    selection,
                    targets,
                    contents,
                    claim: fields.opt_bool(8, "claim")?.unwrap_or(true),
                    greedy: fields.opt_bool(9, "greedy")?,
                    synchronous: fields.opt_bool(10, "synchronous")?.unwrap_or(false),
                }
            }
            REQUEST => Self::Request {
                request_id: fields.int(1, "request id")?,
                selection: fields.string(2, "selection")?,
                target: fields.string(3, "target")?,
            },
            CONTENTS => {
                let kind = WireKind::parse(&fields.string(5, "wire kind")?)?;
                let (payload, compress) = fields.payload(6, kind)?;
                let truncated = match fields.get(7) {
                    None | Some(WireValue::None) => 0,
                    Some(_) => u32::try_from(fields.int(7, "truncated")?)
                        .map_err(|_| fields.malformed("truncated count out of range"))?,
                };
                Self::Contents {
                    request_id: fields.int(1, "request id")?,
                    selection: fields.string(2, "selection")?,
                    type_tag: fields.string(3, "type")?,
                    bit_format: fields.u8(4, "format")?,
                    payload,
                    compress,
                    truncated,
                }
            }
            CONTENTS_NONE => Self::ContentsNone {
                request_id: fields.int(1, "request id")?,
                selection: fields.string(2, "selection")?,
            },
            PENDING_REQUESTS => Self::PendingRequests(fields.u8(1, "pending count")?),
            ENABLE_SELECTIONS => Self::EnableSelections(fields.string_list(1, "selections")?),
            other => return Err(SyncError::UnknownPacket(other.to_string())),
        };
        Ok(packet)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token {
                selection,
                targets,
                contents,
                claim,
                ..
            } => write!(
                f,
                "{}({}, {} targets, contents={}, claim={})",
                TOKEN,
                selection,
                targets.as_ref().map_or(0, Vec::len),
                contents.as_ref().map_or("none", |c| c.target.as_str()),
                claim
            ),
            Self::Request {
                request_id,
                selection,
                target,
            } => write!(f, "{}({}, {}, {})", REQUEST, request_id, selection, target),
            Self::Contents {
                request_id,
                selection,
                type_tag,
                payload,
                ..
            } => write!(
                f,
                "{}({}, {}, {}, {} {})",
                CONTENTS,
                request_id,
                selection,
                type_tag,
                payload.len(),
                payload.kind()
            ),
            Self::ContentsNone { request_id, selection } => {
                write!(f, "{}({}, {})", CONTENTS_NONE, request_id, selection)
            }
            Self::PendingRequests(count) => write!(f, "{}({})", PENDING_REQUESTS, count),
            Self::EnableSelections(selections) => write!(f, "{}({:?})", ENABLE_SELECTIONS, selections),
        }
    }
}

fn string_list(values: &[String]) -> WireValue {
    WireValue::List(values.iter().cloned().map(WireValue::Str).collect())
}

fn payload_to_wire(payload: &WirePayload, compress: bool) -> WireValue {
    match payload {
        WirePayload::Bytes(bytes) if compress => WireValue::Compressible(bytes.clone()),
        WirePayload::Bytes(bytes) => WireValue::Bytes(bytes.clone()),
        WirePayload::Integers(values) => WireValue::List(values.iter().copied().map(WireValue::Int).collect()),
        WirePayload::Atoms(names) => string_list(names),
    }
}

/// Positional accessor with packet-aware error messages
struct Fields {
    name: String,
    values: Vec<WireValue>,
}

impl Fields {
    fn new(values: Vec<WireValue>) -> Result<Self> {
        let name = match values.first() {
            Some(WireValue::Str(name)) => name.clone(),
            Some(_) => return Err(SyncError::malformed("?", "packet type is not a string")),
            None => return Err(SyncError::malformed("?", "empty packet")),
        };
        Ok(Self { name, values })
    }

    fn malformed(&self, reason: impl Into<String>) -> SyncError {
        SyncError::malformed(self.name.clone(), reason)
    }

    fn get(&self, index: usize) -> Option<&WireValue> {
        self.values.get(index)
    }

    fn require(&self, index: usize, field: &str) -> Result<&WireValue> {
        self.get(index)
            .ok_or_else(|| self.malformed(format!("missing {} at position {}", field, index)))
    }

    fn string(&self, index: usize, field: &str) -> Result<String> {
        match self.require(index, field)? {
            WireValue::Str(s) => Ok(s.clone()),
            WireValue::Bytes(b) => {
                String::from_utf8(b.clone()).map_err(|_| self.malformed(format!("{} is not valid UTF-8", field)))
            }
            other => Err(self.malformed(format!("{} is not a string: {:?}", field, other))),
        }
    }

    fn int(&self, index: usize, field: &str) -> Result<u64> {
        match self.require(index, field)? {
            WireValue::Int(v) => Ok(*v),
            other => Err(self.malformed(format!("{} is not an integer: {:?}", field, other))),
        }
    }

    fn u8(&self, index: usize, field: &str) -> Result<u8> {
        let value = self.int(index, field)?;
        u8::try_from(value).map_err(|_| self.malformed(format!("{} out of range: {}", field, value)))
    }

    fn opt_bool(&self, index: usize, field: &str) -> Result<Option<bool>> {
        match self.get(index) {
            None | Some(WireValue::None) => Ok(None),
            Some(WireValue::Bool(b)) => Ok(Some(*b)),
            Some(WireValue::Int(v)) => Ok(Some(*v != 0)),
            Some(other) => Err(self.malformed(format!("{} is not a boolean: {:?}", field, other))),
        }
    }

    fn string_list(&self, index: usize, field: &str) -> Result<Vec<String>> {
        match self.require(index, field)? {
            WireValue::List(items) => items
                .iter()
                .map(|item| match item {
                    WireValue::Str(s) => Ok(s.clone()),
                    other => Err(self.malformed(format!("{} entry is not a string: {:?}", field, other))),
                })
                .collect(),
            other => Err(self.malformed(format!("{} is not a list: {:?}", field, other))),
        }
    }

    fn payload(&self, index: usize, kind: WireKind) -> Result<(WirePayload, bool)> {
        let value = self.require(index, "payload")?;
        let payload = match (kind, value) {
            (WireKind::Bytes, WireValue::Bytes(b)) => (WirePayload::Bytes(b.clone()), false),
            (WireKind::Bytes, WireValue::Compressible(b)) => (WirePayload::Bytes(b.clone()), true),
            (WireKind::Bytes, WireValue::Str(s)) => (WirePayload::Bytes(s.as_bytes().to_vec()), false),
            (WireKind::Integers, WireValue::List(items)) => {
                let values = items
                    .iter()
                    .map(|item| match item {
                        WireValue::Int(v) => Ok(*v),
                        other => Err(self.malformed(format!("integer payload entry {:?}", other))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                (WirePayload::Integers(values), false)
            }
            (WireKind::Atoms, WireValue::List(_)) => (WirePayload::Atoms(self.string_list(index, "atoms")?), false),
            (kind, other) => {
                return Err(self.malformed(format!("{} payload does not match {:?}", kind, other)));
            }
        };
        Ok(payload)
    }
}
