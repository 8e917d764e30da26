//! Configuration management
//!
//! Handles loading and validation of the TOML configuration, and compiles
//! it into the runtime [`EngineConfig`]. Every configuration error surfaces
//! here, at startup.

use anyhow::{Context, Result};
use lamco_clipboard_core::targets::{DEFAULT_DISCARD_EXTRA_TARGETS, DEFAULT_DISCARD_TARGETS};
use lamco_clipboard_core::{CodecConfig, DenyList, TargetFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

pub mod types;

pub use types::{ClipboardConfig, ClipboardTranslation, LoggingConfig, SelectionSets};

use crate::clipboard::dispatcher::EngineConfig;
use crate::clipboard::proxy::default_translated_targets;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Clipboard configuration
    #[serde(default)]
    pub clipboard: ClipboardConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration
    pub fn default_config() -> Result<Self> {
        Ok(Config::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}", self.logging.level),
        }

        self.clipboard.to_engine_config().map(|_| ())
    }
}

impl ClipboardConfig {
    /// Transfer direction as `(can_send, can_receive)`
    pub fn direction(&self) -> Result<(bool, bool)> {
        match self.direction.as_str() {
            "both" => Ok((true, true)),
            "send" => Ok((true, false)),
            "receive" => Ok((false, true)),
            "disabled" => Ok((false, false)),
            other => anyhow::bail!("Invalid clipboard direction: {}", other),
        }
    }

    /// Local ↔ remote main clipboard names, when a translation applies
    pub fn translation(&self) -> Option<(String, String)> {
        let ClipboardTranslation { local, remote } = &self.clipboard;
        if self.clipboards.remote.is_empty() || local == remote {
            return None;
        }
        Some((local.clone(), remote.clone()))
    }

    /// Compile into the runtime engine configuration
    pub fn to_engine_config(&self) -> Result<EngineConfig> {
        let (can_send, can_receive) = self.direction()?;

        let local = &self.clipboards.local;
        if local.is_empty() {
            anyhow::bail!("No local selections configured");
        }
        check_names("clipboards.local", local)?;
        check_names("clipboards.remote", &self.clipboards.remote)?;

        let translation = self.translation();
        if let Some((l, r)) = &translation {
            if !local.contains(l) {
                anyhow::bail!("clipboard.local {} is not one of the local selections {:?}", l, local);
            }
            if !self.clipboards.remote.contains(r) {
                anyhow::bail!(
                    "clipboard.remote {} is not one of the remote selections {:?}",
                    r,
                    self.clipboards.remote
                );
            }
        }

        if self.max_packet_size == 0 {
            anyhow::bail!("max-packet-size must be greater than 0");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request-timeout-ms must be greater than 0");
        }

        let codec = CodecConfig {
            max_send_size: self.max_send_size,
            max_receive_size: self.max_receive_size,
            max_packet_size: self.max_packet_size,
            min_compress_size: self.min_compress_size,
            byte_filters: Vec::new(),
        }
        .with_byte_filters(&self.filters)
        .context("Invalid clipboard filter")?;

        let discard_patterns = DEFAULT_DISCARD_TARGETS
            .iter()
            .map(|p| p.to_string())
            .chain(self.discard_targets.iter().cloned());
        let extra_patterns = DEFAULT_DISCARD_EXTRA_TARGETS
            .iter()
            .map(|p| p.to_string())
            .chain(self.discard_extra_targets.iter().cloned());
        let filter = TargetFilter::new(
            DenyList::new(self.discard_target_names.clone(), discard_patterns)
                .context("Invalid discard-targets pattern")?,
            DenyList::new(Vec::<String>::new(), extra_patterns).context("Invalid discard-extra-targets pattern")?,
        );

        let mut translated_targets = default_translated_targets();
        translated_targets.extend(self.translated_targets.clone());

        Ok(EngineConfig {
            local_selections: local.clone(),
            remote_selections: self.clipboards.remote.clone(),
            translation,
            can_send,
            can_receive,
            want_targets: self.want_targets,
            greedy_client: false,
            greedy: self.greedy,
            synchronous: self.synchronous,
            codec,
            filter,
            translated_targets,
            preferred_targets: self.preferred_targets.clone(),
            remote_timeout: Duration::from_millis(self.request_timeout_ms),
            emit_delay: Duration::from_millis(self.emit_delay_ms),
            owner_change_embargo: Duration::from_millis(self.owner_change_embargo_ms),
            incremental_timeout: Duration::from_millis(self.incremental_timeout_ms),
            native_timeout: Duration::from_millis(self.native_timeout_ms),
            max_incremental_size: lamco_clipboard_core::DEFAULT_MAX_SIZE,
            send_pending_requests: self.send_pending_requests,
        })
    }
}

fn check_names(option: &str, names: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            anyhow::bail!("Invalid selection name in {}: {:?}", option, name);
        }
        if !seen.insert(name) {
            anyhow::bail!("Duplicate selection name in {}: {}", option, name);
        }
    }
    Ok(())
}
