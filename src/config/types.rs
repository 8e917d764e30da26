//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Clipboard synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClipboardConfig {
    /// Transfer direction ("both", "send", "receive", "disabled")
    #[serde(default = "default_direction")]
    pub direction: String,

    /// Never send a payload larger than this many bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Truncate outgoing data to this many bytes (0 = no limit)
    #[serde(default)]
    pub max_send_size: usize,

    /// Truncate incoming data to this many bytes (0 = no limit)
    #[serde(default)]
    pub max_receive_size: usize,

    /// Tag payloads at or above this size for transport compression
    #[serde(default = "default_min_compress_size")]
    pub min_compress_size: usize,

    /// Regexes over 8-bit contents; matching values are never sent
    #[serde(default)]
    pub filters: Vec<String>,

    /// Extra target patterns that must never cross the wire
    #[serde(default)]
    pub discard_targets: Vec<String>,

    /// Exact target names that must never cross the wire
    #[serde(default)]
    pub discard_target_names: Vec<String>,

    /// Extra patterns for targets only served when the peer advertised them
    #[serde(default)]
    pub discard_extra_targets: Vec<String>,

    /// Selection name sets
    #[serde(default)]
    pub clipboards: SelectionSets,

    /// Single-name translation of the main clipboard
    #[serde(default)]
    pub clipboard: ClipboardTranslation,

    /// Remote request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Token emission debounce delay in milliseconds
    #[serde(default = "default_emit_delay_ms")]
    pub emit_delay_ms: u64,

    /// Owner changes ignored for this long after a claim or emission
    #[serde(default = "default_owner_change_embargo_ms")]
    pub owner_change_embargo_ms: u64,

    /// Incremental read inactivity timeout in milliseconds
    #[serde(default = "default_incremental_timeout_ms")]
    pub incremental_timeout_ms: u64,

    /// Limit for one native clipboard call in milliseconds
    #[serde(default = "default_native_timeout_ms")]
    pub native_timeout_ms: u64,

    /// Assume the peer wants target lists
    #[serde(default)]
    pub want_targets: bool,

    /// Ask the peer to push contents with every token
    #[serde(default)]
    pub greedy: bool,

    /// Ask the peer to write text to our clipboard immediately
    #[serde(default)]
    pub synchronous: bool,

    /// Targets preferred by the peer
    #[serde(default)]
    pub preferred_targets: Vec<String>,

    /// Additional target translations (requested → served from)
    #[serde(default)]
    pub translated_targets: HashMap<String, Vec<String>>,

    /// Send clipboard-pending-requests progress hints
    #[serde(default = "default_true")]
    pub send_pending_requests: bool,
}

/// Selection names on both sides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSets {
    /// Selections synchronized locally
    #[serde(default = "default_local_selections")]
    pub local: Vec<String>,

    /// Selections the peer exposes (empty = same as local, no translation)
    #[serde(default)]
    pub remote: Vec<String>,
}

impl Default for SelectionSets {
    fn default() -> Self {
        Self {
            local: default_local_selections(),
            remote: Vec::new(),
        }
    }
}

/// Local and remote name of the main clipboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardTranslation {
    /// Local name
    #[serde(default = "default_clipboard_name")]
    pub local: String,

    /// Name on the peer
    #[serde(default = "default_clipboard_name")]
    pub remote: String,
}

impl Default for ClipboardTranslation {
    fn default() -> Self {
        Self {
            local: default_clipboard_name(),
            remote: default_clipboard_name(),
        }
    }
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            direction: default_direction(),
            max_packet_size: default_max_packet_size(),
            max_send_size: 0,
            max_receive_size: 0,
            min_compress_size: default_min_compress_size(),
            filters: Vec::new(),
            discard_targets: Vec::new(),
            discard_target_names: Vec::new(),
            discard_extra_targets: Vec::new(),
            clipboards: SelectionSets::default(),
            clipboard: ClipboardTranslation::default(),
            request_timeout_ms: default_request_timeout_ms(),
            emit_delay_ms: default_emit_delay_ms(),
            owner_change_embargo_ms: default_owner_change_embargo_ms(),
            incremental_timeout_ms: default_incremental_timeout_ms(),
            native_timeout_ms: default_native_timeout_ms(),
            want_targets: false,
            greedy: false,
            synchronous: false,
            preferred_targets: Vec::new(),
            translated_targets: HashMap::new(),
            send_pending_requests: true,
        }
    }
}

fn default_direction() -> String {
    "both".to_string()
}

fn default_max_packet_size() -> usize {
    lamco_clipboard_core::wire::DEFAULT_MAX_PACKET_SIZE
}

fn default_min_compress_size() -> usize {
    lamco_clipboard_core::wire::DEFAULT_MIN_COMPRESS_SIZE
}

fn default_local_selections() -> Vec<String> {
    vec!["CLIPBOARD".to_string(), "PRIMARY".to_string(), "SECONDARY".to_string()]
}

fn default_clipboard_name() -> String {
    "CLIPBOARD".to_string()
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_emit_delay_ms() -> u64 {
    100
}

fn default_owner_change_embargo_ms() -> u64 {
    100
}

fn default_incremental_timeout_ms() -> u64 {
    lamco_clipboard_core::DEFAULT_INCREMENTAL_TIMEOUT_MS
}

fn default_native_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    pub level: String,

    /// Directory for log files (None = console only)
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}
