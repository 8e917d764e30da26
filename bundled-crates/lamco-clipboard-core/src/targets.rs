//! Target (format identifier) filtering.
//!
//! Some targets must never cross the wire: platform-proprietary pasteboard
//! types, file-manager internals and similar. Others are requested by
//! applications even when the owner never advertised them; forwarding those
//! only produces a request that times out, so they are answered locally.
//!
//! # Example
//!
//! ```rust
//! use lamco_clipboard_core::TargetFilter;
//!
//! let filter = TargetFilter::default();
//! let kept = filter.filter(["UTF8_STRING", "com.apple.traditional-mac-plain-text", "SAVE_TARGETS"]);
//! assert_eq!(kept, vec!["UTF8_STRING".to_string()]);
//! ```

use regex::Regex;
use std::collections::BTreeSet;
use tracing::debug;

use crate::{ClipboardError, ClipboardResult};

/// The pseudo-target used to ask a selection owner for its target list
pub const TARGETS: &str = "TARGETS";

/// Targets that must never be forwarded (regex patterns)
pub const DEFAULT_DISCARD_TARGETS: &[&str] = &[
    r"^NeXT",
    r"^com\.apple\.",
    r"^CorePasteboardFlavorType",
    r"^dyn\.",
    // eclipse
    r"^resource-transfer-format",
    // gnome file copy
    r"^x-special/",
];

/// Targets applications request without them being advertised (regex patterns)
pub const DEFAULT_DISCARD_EXTRA_TARGETS: &[&str] = &[r"^SAVE_TARGETS$", r"^COMPOUND_TEXT", r"GTK_TEXT_BUFFER_CONTENTS"];

/// Text targets, in order of preference
pub const TEXT_TARGETS: &[&str] = &["UTF8_STRING", "TEXT", "STRING", "text/plain", "text/html"];

/// Image targets preferred for greedy peers that listed them
pub const IMAGE_TARGETS: &[&str] = &["image/png", "image/jpeg"];

/// Targets that can be served from another advertised target
pub const DEFAULT_TRANSLATED_TARGETS: &[(&str, &str)] = &[("application/x-moz-nativehtml", "UTF8_STRING")];

/// Returns true if `target` is one of the well-known text targets
pub fn is_text_target(target: &str) -> bool {
    TEXT_TARGETS.contains(&target)
}

/// Compile a list of regex patterns, failing on the first invalid one.
pub fn compile_patterns<I, S>(patterns: I) -> ClipboardResult<Vec<Regex>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| {
            let pattern = p.as_ref();
            Regex::new(pattern).map_err(|source| ClipboardError::InvalidFilter {
                pattern: pattern.to_string(),
                source,
            })
        })
        .collect()
}

/// A denylist of exact names and regex patterns
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    exact: BTreeSet<String>,
    patterns: Vec<Regex>,
}

impl DenyList {
    /// Build a denylist, compiling every pattern
    pub fn new<E, P, S, T>(exact: E, patterns: P) -> ClipboardResult<Self>
    where
        E: IntoIterator<Item = S>,
        S: Into<String>,
        P: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        Ok(Self {
            exact: exact.into_iter().map(Into::into).collect(),
            patterns: compile_patterns(patterns)?,
        })
    }

    /// Returns true if the name is denied
    pub fn matches(&self, name: &str) -> bool {
        self.exact.contains(name) || self.patterns.iter().any(|re| re.is_match(name))
    }

    /// Source patterns, for diagnostics
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().map(|re| re.as_str().to_string()).collect()
    }

    /// Number of entries (exact names plus patterns)
    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    /// Returns true if nothing is denied
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filters target lists before they are advertised or accepted
#[derive(Debug, Clone)]
pub struct TargetFilter {
    discard: DenyList,
    discard_extra: DenyList,
}

impl TargetFilter {
    /// Create a filter from explicit denylists
    pub fn new(discard: DenyList, discard_extra: DenyList) -> Self {
        Self { discard, discard_extra }
    }

    /// Create a filter with the built-in denylists
    pub fn with_defaults() -> ClipboardResult<Self> {
        Ok(Self {
            discard: DenyList::new(Vec::<String>::new(), DEFAULT_DISCARD_TARGETS)?,
            discard_extra: DenyList::new(Vec::<String>::new(), DEFAULT_DISCARD_EXTRA_TARGETS)?,
        })
    }

    /// Target must never be forwarded in either direction
    pub fn must_discard(&self, target: &str) -> bool {
        self.discard.matches(target)
    }

    /// Target is low value and is only honoured when it was advertised
    pub fn must_discard_extra(&self, target: &str) -> bool {
        self.discard_extra.matches(target)
    }

    /// Remove every discarded or extra target, preserving order
    pub fn filter<I, S>(&self, targets: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut dropped = 0usize;
        let kept: Vec<String> = targets
            .into_iter()
            .filter_map(|t| {
                let t = t.as_ref();
                if self.must_discard(t) || self.must_discard_extra(t) {
                    dropped += 1;
                    None
                } else {
                    Some(t.to_string())
                }
            })
            .collect();
        if dropped > 0 {
            debug!("filtered {} target(s), kept {:?}", dropped, kept);
        }
        kept
    }

    /// The main denylist
    pub fn discard(&self) -> &DenyList {
        &self.discard
    }

    /// The extra denylist
    pub fn discard_extra(&self) -> &DenyList {
        &self.discard_extra
    }
}

impl Default for TargetFilter {
    fn default() -> Self {
        Self::with_defaults().expect("built-in target patterns are valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_drops_proprietary_targets() {
        let filter = TargetFilter::default();
        let kept = filter.filter([
            "UTF8_STRING",
            "NeXT plain ascii pasteboard type",
            "com.apple.pasteboard.promised-file-url",
            "dyn.ah62d4rv4gu8y",
            "x-special/gnome-copied-files",
            "image/png",
        ]);
        assert_eq!(kept, vec!["UTF8_STRING", "image/png"]);
    }

    #[test]
    fn test_extra_targets_are_dropped() {
        let filter = TargetFilter::default();
        assert!(filter.must_discard_extra("SAVE_TARGETS"));
        assert!(filter.must_discard_extra("COMPOUND_TEXT"));
        assert!(!filter.must_discard_extra("SAVE_TARGETS_LATER"));
        assert!(filter.filter(["SAVE_TARGETS", "TEXT"]) == vec!["TEXT".to_string()]);
    }

    #[test]
    fn test_exact_names() {
        let discard = DenyList::new(["secret/password"], Vec::<String>::new()).unwrap();
        let filter = TargetFilter::new(discard, DenyList::default());
        assert!(filter.must_discard("secret/password"));
        assert!(!filter.must_discard("secret/password2"));
        assert_eq!(filter.filter(["secret/password", "STRING"]), vec!["STRING"]);
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let result = DenyList::new(Vec::<String>::new(), ["(unclosed"]);
        assert!(matches!(result, Err(ClipboardError::InvalidFilter { .. })));
    }

    #[test]
    fn test_filter_empty_input() {
        let filter = TargetFilter::default();
        assert!(filter.filter(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_text_targets() {
        assert!(is_text_target("UTF8_STRING"));
        assert!(!is_text_target("image/png"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn discarded_targets_never_survive(suffix in "[a-zA-Z0-9._-]{0,16}", others in proptest::collection::vec("[A-Z_]{1,12}", 0..6)) {
                let filter = TargetFilter::default();
                let denied = format!("com.apple.{}", suffix);
                let mut input = others.clone();
                input.push(denied.clone());
                input.push("SAVE_TARGETS".to_string());
                let kept = filter.filter(&input);
                prop_assert!(!kept.contains(&denied));
                prop_assert!(!kept.iter().any(|t| t == "SAVE_TARGETS"));
            }
        }
    }
}
