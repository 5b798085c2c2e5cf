//! Metric key canonicalization and display aliases.
//!
//! The backend has written the same metric under many spellings over time
//! (`attributes.ag.metrics.costs.cumulative.total`, `totalCost`, `cost`).
//! Lookups go through one canonical form.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

/// Path segment that roots span attributes in trace-derived metric keys.
pub const AG_MARKER: &str = "attributes.ag.";

static ACCUMULATION_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(cumulative|incremental)\.").unwrap());

/// Prefixes stripped during canonicalization, longest first.
const STRIPPED_PREFIXES: &[&str] = &[
    "attributes.ag.data.outputs.",
    "attributes.ag.metrics.",
    "attributes.ag.",
    "data.outputs.",
    "outputs.",
    "metrics.",
];

/// Historical spellings of the built-in aggregates.
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("totalCost", "costs.total"),
    ("cost", "costs.total"),
    ("costs", "costs.total"),
    ("latency", "duration.total"),
    ("duration", "duration.total"),
    ("totalTokens", "tokens.total"),
    ("tokens", "tokens.total"),
    ("promptTokens", "tokens.prompt"),
    ("completionTokens", "tokens.completion"),
    ("errors", "errors.total"),
];

/// Composite aliases written during flattening (canonical ⇢ alias).
const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("costs.total", "totalCost"),
    ("duration.total", "latency"),
    ("tokens.total", "totalTokens"),
    ("tokens.prompt", "promptTokens"),
    ("tokens.completion", "completionTokens"),
];

/// Maps any historical spelling of a metric key to one stable key.
pub trait KeyCanonicalizer: Send + Sync {
    fn canonicalize(&self, key: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCanonicalizer;

impl KeyCanonicalizer for DefaultCanonicalizer {
    fn canonicalize(&self, key: &str) -> String {
        let mut key = key.trim();
        for prefix in STRIPPED_PREFIXES {
            if let Some(rest) = key.strip_prefix(prefix) {
                key = rest;
                break;
            }
        }
        let collapsed = ACCUMULATION_SEGMENT.replace_all(key, ".");
        LEGACY_KEYS
            .iter()
            .find(|(legacy, _)| *legacy == collapsed.as_ref())
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or_else(|| collapsed.into_owned())
    }
}

/// Key policy shared by flattening and lookups.
#[derive(Clone)]
pub struct MetricKeys {
    canonicalizer: Arc<dyn KeyCanonicalizer>,
    aliases: Vec<(String, String)>,
}

impl Default for MetricKeys {
    fn default() -> Self {
        Self::new(Arc::new(DefaultCanonicalizer))
    }
}

impl std::fmt::Debug for MetricKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricKeys")
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl MetricKeys {
    pub fn new(canonicalizer: Arc<dyn KeyCanonicalizer>) -> Self {
        Self {
            canonicalizer,
            aliases: DEFAULT_ALIASES
                .iter()
                .map(|(k, a)| (k.to_string(), a.to_string()))
                .collect(),
        }
    }

    pub fn with_alias(mut self, canonical: impl Into<String>, alias: impl Into<String>) -> Self {
        self.aliases.push((canonical.into(), alias.into()));
        self
    }

    pub fn canonicalize(&self, key: &str) -> String {
        self.canonicalizer.canonicalize(key)
    }

    /// Aliases configured for a key (matched on raw or canonical form).
    pub fn aliases_for<'a>(&'a self, key: &'a str, canonical: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.aliases
            .iter()
            .filter(move |(k, _)| k == key || k == canonical)
            .map(|(_, alias)| alias.as_str())
    }
}

/// The part of `path` starting at the `attributes.ag.` marker, if any.
pub fn reroot_at_marker(path: &str) -> Option<&str> {
    let idx = path.find(AG_MARKER)?;
    if idx == 0 {
        return None;
    }
    Some(&path[idx..])
}

/// Last dotted segment of a key.
pub fn terminal_segment(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or(key)
}
