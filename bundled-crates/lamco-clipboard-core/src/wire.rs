//! Wire codec for selection data.
//!
//! Native selection data is a `(type_tag, bit_format, bytes)` triple whose
//! byte layout depends on the host (format 32 is a platform `long`, stored in
//! native endianness). The codec converts it to an endian-neutral wire form
//! and back:
//!
//! | bit format | wire kind  | wire value                        |
//! |------------|------------|-----------------------------------|
//! | 8          | `bytes`    | opaque bytes                      |
//! | 16         | `integers` | one value per 16-bit element      |
//! | 32         | `integers` | one value per platform word       |
//! | any        | `atoms`    | target names (`TARGETS` replies)  |
//!
//! The codec also owns the size policy (truncation on send and receive) and
//! the compression policy. It never compresses anything itself: payloads are
//! only tagged so that the transport can decide.

use regex::bytes::Regex as BytesRegex;
use std::ffi::c_ulong;
use std::fmt;
use tracing::{debug, info, warn};

use crate::targets::{TargetFilter, TARGETS};
use crate::{ClipboardError, ClipboardResult};

/// Payloads at or above this size are tagged compressible
pub const DEFAULT_MIN_COMPRESS_SIZE: usize = 512;

/// Largest payload that will ever be sent: 16MB
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Types that cannot be marshalled: they only make sense inside one display
pub const UNMARSHALABLE_TYPES: &[&str] = &["WINDOW", "PIXMAP", "BITMAP", "DRAWABLE", "PIXEL", "COLORMAP"];

/// Element width of native selection data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitFormat {
    /// Opaque bytes
    Eight,
    /// 16-bit integers
    Sixteen,
    /// Platform words (`long`)
    ThirtyTwo,
}

impl BitFormat {
    /// Nominal width in bits (8, 16 or 32)
    pub fn bits(self) -> u32 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
            Self::ThirtyTwo => 32,
        }
    }

    /// Size in bytes of one element in native memory.
    ///
    /// Format 32 is a C `long`, which is 8 bytes on LP64 hosts.
    pub fn element_size(self) -> usize {
        match self {
            Self::Eight => 1,
            Self::Sixteen => 2,
            Self::ThirtyTwo => std::mem::size_of::<c_ulong>(),
        }
    }

    fn max_value(self) -> u64 {
        match self.element_size() {
            1 => u8::MAX as u64,
            2 => u16::MAX as u64,
            4 => u32::MAX as u64,
            _ => u64::MAX,
        }
    }
}

impl TryFrom<u32> for BitFormat {
    type Error = ClipboardError;

    fn try_from(value: u32) -> ClipboardResult<Self> {
        match value {
            8 => Ok(Self::Eight),
            16 => Ok(Self::Sixteen),
            32 => Ok(Self::ThirtyTwo),
            other => Err(ClipboardError::UnsupportedBitFormat(other)),
        }
    }
}

impl TryFrom<u8> for BitFormat {
    type Error = ClipboardError;

    fn try_from(value: u8) -> ClipboardResult<Self> {
        Self::try_from(value as u32)
    }
}

impl From<BitFormat> for u8 {
    fn from(format: BitFormat) -> u8 {
        format.bits() as u8
    }
}

impl fmt::Display for BitFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Value held by a selection for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionValue {
    /// Raw native bytes
    Bytes(Vec<u8>),
    /// A list of target names (answer to `TARGETS`)
    Targets(Vec<String>),
}

impl SelectionValue {
    /// Size in bytes (or number of names for target lists)
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Targets(t) => t.len(),
        }
    }

    /// Returns true if there is nothing in the value
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Data returned by a selection owner for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetData {
    /// Type of the data, e.g. `UTF8_STRING` or `ATOM`
    pub type_tag: String,
    /// Element width
    pub format: BitFormat,
    /// The data itself
    pub value: SelectionValue,
}

impl TargetData {
    /// Opaque 8-bit data
    pub fn bytes(type_tag: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            type_tag: type_tag.into(),
            format: BitFormat::Eight,
            value: SelectionValue::Bytes(data.into()),
        }
    }

    /// UTF-8 text
    pub fn text(text: &str) -> Self {
        Self::bytes("UTF8_STRING", text.as_bytes())
    }

    /// A target list, as returned for `TARGETS`
    pub fn targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            type_tag: "ATOM".to_string(),
            format: BitFormat::ThirtyTwo,
            value: SelectionValue::Targets(targets.into_iter().map(Into::into).collect()),
        }
    }

    /// Raw bytes, if this is not a target list
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            SelectionValue::Bytes(b) => Some(b),
            SelectionValue::Targets(_) => None,
        }
    }
}

/// Wire representation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireKind {
    /// Opaque bytes
    Bytes,
    /// Integer sequence
    Integers,
    /// Target name sequence
    Atoms,
}

impl WireKind {
    /// Name used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bytes => "bytes",
            Self::Integers => "integers",
            Self::Atoms => "atoms",
        }
    }

    /// Parse a wire kind name
    pub fn parse(name: &str) -> ClipboardResult<Self> {
        match name {
            "bytes" => Ok(Self::Bytes),
            "integers" => Ok(Self::Integers),
            "atoms" => Ok(Self::Atoms),
            other => Err(ClipboardError::UnknownWireKind(other.to_string())),
        }
    }
}

impl fmt::Display for WireKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endian-neutral selection payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// One value per native element
    Integers(Vec<u64>),
    /// Target names
    Atoms(Vec<String>),
}

impl WirePayload {
    /// Wire kind of this payload
    pub fn kind(&self) -> WireKind {
        match self {
            Self::Bytes(_) => WireKind::Bytes,
            Self::Integers(_) => WireKind::Integers,
            Self::Atoms(_) => WireKind::Atoms,
        }
    }

    /// Number of elements (bytes, integers or names)
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Integers(i) => i.len(),
            Self::Atoms(a) => a.len(),
        }
    }

    /// Returns true if the payload has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of the compression policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionDecision {
    /// Send as-is, tagged for compression by the transport
    Compressed,
    /// Send as-is, too small to be worth compressing
    Raw,
    /// Larger than the maximum packet size: must not be sent
    RejectTooLarge,
}

/// Contents ready to be placed in a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedContents {
    /// Type of the data
    pub type_tag: String,
    /// Element width
    pub format: BitFormat,
    /// Wire payload
    pub payload: WirePayload,
    /// Transport should compress the payload
    pub compress: bool,
    /// Bytes dropped by the send size limit
    pub truncated: u32,
}

/// Result of preparing contents for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedContents {
    /// Send these contents
    Ready(EncodedContents),
    /// The data cannot be represented on the wire, answer "no data"
    Dropped,
    /// The payload exceeds the packet size limit, send nothing
    Rejected {
        /// Payload size
        size: usize,
        /// Configured limit
        max: usize,
    },
}

/// Size and filtering policy for the codec
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Truncate outgoing data to this many bytes (0 disables)
    pub max_send_size: usize,
    /// Truncate incoming data to this many bytes (0 disables)
    pub max_receive_size: usize,
    /// Never send a payload larger than this
    pub max_packet_size: usize,
    /// Tag byte payloads at or above this size as compressible
    pub min_compress_size: usize,
    /// 8-bit data matching any of these is never sent
    pub byte_filters: Vec<BytesRegex>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_send_size: 0,
            max_receive_size: 0,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            min_compress_size: DEFAULT_MIN_COMPRESS_SIZE,
            byte_filters: Vec::new(),
        }
    }
}

impl CodecConfig {
    /// Compile byte-string filters. Patterns match at the start of the data.
    pub fn with_byte_filters<I, S>(mut self, patterns: I) -> ClipboardResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.byte_filters = compile_byte_filters(patterns)?;
        Ok(self)
    }
}

/// Compile byte-string filter patterns, anchored at the start of the data
pub fn compile_byte_filters<I, S>(patterns: I) -> ClipboardResult<Vec<BytesRegex>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| {
            let pattern = p.as_ref();
            BytesRegex::new(&format!("^(?:{})", pattern)).map_err(|source| ClipboardError::InvalidFilter {
                pattern: pattern.to_string(),
                source,
            })
        })
        .collect()
}

/// Converts selection data to and from its wire representation.
///
/// # Example
///
/// ```rust
/// use lamco_clipboard_core::{SelectionValue, TargetData, WireCodec, WirePayload};
///
/// let codec = WireCodec::default();
/// let data = TargetData::text("hello");
/// let payload = codec.encode("UTF8_STRING", &data).unwrap().unwrap();
/// assert_eq!(payload, WirePayload::Bytes(b"hello".to_vec()));
///
/// let value = codec.decode("UTF8_STRING", data.format, payload).unwrap();
/// assert_eq!(value, SelectionValue::Bytes(b"hello".to_vec()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct WireCodec {
    config: CodecConfig,
    filter: TargetFilter,
}

impl WireCodec {
    /// Create a codec with the given policy and target filter
    pub fn new(config: CodecConfig, filter: TargetFilter) -> Self {
        Self { config, filter }
    }

    /// Current policy
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Target filter applied to `TARGETS` replies
    pub fn filter(&self) -> &TargetFilter {
        &self.filter
    }

    /// Update the send and receive size limits (0 disables)
    pub fn set_limits(&mut self, max_send_size: usize, max_receive_size: usize) {
        self.config.max_send_size = max_send_size;
        self.config.max_receive_size = max_receive_size;
    }

    /// Encode native data for the wire.
    ///
    /// Returns `Ok(None)` when the data must not be sent at all. Fails if the
    /// byte length is not a whole number of elements.
    pub fn encode(&self, target: &str, data: &TargetData) -> ClipboardResult<Option<WirePayload>> {
        if UNMARSHALABLE_TYPES.contains(&data.type_tag.as_str()) {
            debug!("skipping selection data of type {} (format {})", data.type_tag, data.format);
            return Ok(None);
        }
        let bytes = match &data.value {
            SelectionValue::Targets(targets) => {
                let names = if target == TARGETS {
                    self.filter.filter(targets)
                } else {
                    targets.clone()
                };
                return Ok(Some(WirePayload::Atoms(names)));
            }
            SelectionValue::Bytes(bytes) => bytes,
        };

        match data.format {
            BitFormat::ThirtyTwo => {
                if matches!(data.type_tag.as_str(), "ATOM" | "ATOM_PAIR") {
                    // atoms only travel as resolved target lists
                    debug!("dropping raw {} data for {}", data.type_tag, target);
                    return Ok(None);
                }
                Ok(Some(WirePayload::Integers(unpack_integers(bytes, data.format)?)))
            }
            BitFormat::Sixteen => Ok(Some(WirePayload::Integers(unpack_integers(bytes, data.format)?))),
            BitFormat::Eight => {
                if let Some(re) = self.config.byte_filters.iter().find(|re| re.is_match(bytes)) {
                    warn!(
                        "selection data for {} matches filter '{}' and has been dropped",
                        target,
                        re.as_str()
                    );
                    return Ok(None);
                }
                Ok(Some(WirePayload::Bytes(bytes.clone())))
            }
        }
    }

    /// Decode a wire payload back into native data
    pub fn decode(&self, type_tag: &str, format: BitFormat, payload: WirePayload) -> ClipboardResult<SelectionValue> {
        let max_elements = max_elements(self.config.max_receive_size, format);
        match payload {
            WirePayload::Bytes(mut bytes) => {
                if let Some(max) = max_elements {
                    let max_bytes = max * format.element_size();
                    if bytes.len() > max_bytes {
                        info!(
                            "received {} data truncated by policy from {} to {} bytes",
                            type_tag,
                            bytes.len(),
                            max_bytes
                        );
                        bytes.truncate(max_bytes);
                    }
                }
                Ok(SelectionValue::Bytes(bytes))
            }
            WirePayload::Integers(mut values) => {
                if let Some(max) = max_elements {
                    if values.len() > max {
                        info!(
                            "received {} data truncated by policy from {} to {} elements",
                            type_tag,
                            values.len(),
                            max
                        );
                        values.truncate(max);
                    }
                }
                Ok(SelectionValue::Bytes(pack_integers(&values, format)?))
            }
            WirePayload::Atoms(names) => Ok(SelectionValue::Targets(names)),
        }
    }

    /// Truncate outgoing data to the send limit, in whole elements.
    ///
    /// Returns the number of bytes dropped.
    pub fn truncate_for_send(&self, data: &mut TargetData) -> usize {
        let Some(max) = max_elements(self.config.max_send_size, data.format) else {
            return 0;
        };
        let SelectionValue::Bytes(bytes) = &mut data.value else {
            return 0;
        };
        let max_bytes = max * data.format.element_size();
        if bytes.len() <= max_bytes {
            return 0;
        }
        let dropped = bytes.len() - max_bytes;
        bytes.truncate(max_bytes);
        info!(
            "{} data truncated by send policy, {} bytes dropped",
            data.type_tag, dropped
        );
        dropped
    }

    /// Apply the compression and packet size policy
    pub fn decide_compress(&self, payload: &WirePayload) -> CompressionDecision {
        let size = payload.len();
        if size > self.config.max_packet_size {
            return CompressionDecision::RejectTooLarge;
        }
        match payload {
            WirePayload::Bytes(_) if size >= self.config.min_compress_size => CompressionDecision::Compressed,
            _ => CompressionDecision::Raw,
        }
    }

    /// Truncate, encode and apply the compression policy in one step
    pub fn prepare_send(&self, target: &str, mut data: TargetData) -> ClipboardResult<PreparedContents> {
        let truncated = self.truncate_for_send(&mut data);
        let Some(payload) = self.encode(target, &data)? else {
            return Ok(PreparedContents::Dropped);
        };
        let compress = match self.decide_compress(&payload) {
            CompressionDecision::RejectTooLarge => {
                warn!(
                    "selection contents for {} are too big and have not been sent ({} > {})",
                    target,
                    payload.len(),
                    self.config.max_packet_size
                );
                return Ok(PreparedContents::Rejected {
                    size: payload.len(),
                    max: self.config.max_packet_size,
                });
            }
            CompressionDecision::Compressed => true,
            CompressionDecision::Raw => false,
        };
        Ok(PreparedContents::Ready(EncodedContents {
            type_tag: data.type_tag,
            format: data.format,
            payload,
            compress,
            truncated: u32::try_from(truncated).unwrap_or(u32::MAX),
        }))
    }
}

/// Whole elements allowed by a byte limit, `None` when unlimited
fn max_elements(max_size: usize, format: BitFormat) -> Option<usize> {
    if max_size == 0 {
        return None;
    }
    Some(max_size.saturating_mul(8) / format.bits() as usize)
}

fn unpack_integers(bytes: &[u8], format: BitFormat) -> ClipboardResult<Vec<u64>> {
    let size = format.element_size();
    if bytes.len() % size != 0 {
        return Err(ClipboardError::InvalidEncoding(format!(
            "{} bytes is not a whole number of {}-byte elements",
            bytes.len(),
            size
        )));
    }
    bytes.chunks_exact(size).map(read_native).collect()
}

fn read_native(chunk: &[u8]) -> ClipboardResult<u64> {
    let invalid = |_| ClipboardError::InvalidEncoding(format!("bad element size {}", chunk.len()));
    Ok(match chunk.len() {
        1 => chunk[0] as u64,
        2 => u16::from_ne_bytes(chunk.try_into().map_err(invalid)?) as u64,
        4 => u32::from_ne_bytes(chunk.try_into().map_err(invalid)?) as u64,
        8 => u64::from_ne_bytes(chunk.try_into().map_err(invalid)?),
        n => return Err(ClipboardError::InvalidEncoding(format!("bad element size {}", n))),
    })
}

fn pack_integers(values: &[u64], format: BitFormat) -> ClipboardResult<Vec<u8>> {
    let size = format.element_size();
    let max = format.max_value();
    let mut out = Vec::with_capacity(values.len() * size);
    for &value in values {
        if value > max {
            return Err(ClipboardError::InvalidEncoding(format!(
                "value {} does not fit in format {}",
                value, format
            )));
        }
        match size {
            1 => out.push(value as u8),
            2 => out.extend_from_slice(&(value as u16).to_ne_bytes()),
            4 => out.extend_from_slice(&(value as u32).to_ne_bytes()),
            _ => out.extend_from_slice(&value.to_ne_bytes()),
        }
    }
    Ok(out)
}
