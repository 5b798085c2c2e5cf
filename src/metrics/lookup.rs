//! Candidate-key lookup into a scenario's flattened metrics.
//!
//! Metric keys drift between evaluator versions, so one logical metric is
//! probed under many spellings, most specific first. Matching itself is a
//! chain of [`KeyResolver`] strategies tried in order.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::keys::{terminal_segment, MetricKeys};
use crate::models::stats::StatSummary;

/// What the caller is looking for. Every field is optional; candidates are
/// built from whatever is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupRequest {
    pub path: Option<String>,
    pub metric_key: Option<String>,
    pub step_key: Option<String>,
    pub evaluator_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupHit {
    pub strategy: &'static str,
    pub key: String,
    pub value: Value,
}

/// Data a lookup runs against.
pub struct LookupSource<'a> {
    pub flat: &'a BTreeMap<String, StatSummary>,
    pub raw: Option<&'a Map<String, Value>>,
}

pub trait KeyResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, candidates: &[String], source: &LookupSource<'_>) -> Option<(String, Value)>;
}

/// First candidate present verbatim in `flat`.
pub struct ExactCandidate;

impl KeyResolver for ExactCandidate {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn resolve(&self, candidates: &[String], source: &LookupSource<'_>) -> Option<(String, Value)> {
        candidates
            .iter()
            .find_map(|c| source.flat.get(c).map(|stat| (c.clone(), stat.to_value())))
    }
}

/// A flat key ending in `.<candidate>`. The shortest such key wins.
pub struct SuffixMatch;

impl KeyResolver for SuffixMatch {
    fn name(&self) -> &'static str {
        "suffix"
    }

    fn resolve(&self, candidates: &[String], source: &LookupSource<'_>) -> Option<(String, Value)> {
        candidates.iter().find_map(|c| {
            let suffix = format!(".{}", c);
            source
                .flat
                .iter()
                .filter(|(k, _)| k.ends_with(&suffix))
                .min_by_key(|(k, _)| k.len())
                .map(|(k, stat)| (k.clone(), stat.to_value()))
        })
    }
}

/// Walk the raw payload along the candidate's dotted segments. Keys may
/// themselves contain dots, so the longest matching key is tried first.
pub struct RawPathWalk;

impl KeyResolver for RawPathWalk {
    fn name(&self) -> &'static str {
        "raw-path"
    }

    fn resolve(&self, candidates: &[String], source: &LookupSource<'_>) -> Option<(String, Value)> {
        let raw = source.raw?;
        candidates.iter().find_map(|c| {
            let segments: Vec<&str> = c.split('.').filter(|s| !s.is_empty()).collect();
            let (first, rest) = segments.split_first()?;
            walk_from_map(raw, first, rest).map(|v| (c.clone(), v.clone()))
        })
    }
}

fn walk_from_map<'a>(map: &'a Map<String, Value>, first: &str, rest: &[&str]) -> Option<&'a Value> {
    let mut segments = Vec::with_capacity(rest.len() + 1);
    segments.push(first);
    segments.extend_from_slice(rest);

    for take in (1..=segments.len()).rev() {
        let key = segments[..take].join(".");
        if let Some(child) = map.get(&key) {
            if let Some(found) = walk_dotted(child, &segments[take..]) {
                return Some(found);
            }
        }
    }
    None
}

pub fn walk_dotted<'a>(node: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    if segments.is_empty() {
        return match node {
            Value::Null => None,
            _ => Some(node),
        };
    }
    let map = node.as_object()?;
    walk_from_map(map, segments[0], &segments[1..])
}

pub struct MetricLookup {
    keys: MetricKeys,
    chain: Vec<Box<dyn KeyResolver>>,
    debug: bool,
}

impl MetricLookup {
    pub fn new(keys: MetricKeys, debug: bool) -> Self {
        Self {
            keys,
            chain: vec![Box::new(ExactCandidate), Box::new(SuffixMatch), Box::new(RawPathWalk)],
            debug,
        }
    }

    pub fn with_chain(mut self, chain: Vec<Box<dyn KeyResolver>>) -> Self {
        self.chain = chain;
        self
    }

    pub fn keys(&self) -> &MetricKeys {
        &self.keys
    }

    /// Ordered, de-duplicated probe keys: evaluator-prefixed first, then
    /// step-prefixed, then the bare forms.
    pub fn candidates(&self, req: &LookupRequest) -> Vec<String> {
        let mut bases: Vec<String> = Vec::new();
        let mut push_base = |s: String| {
            if !s.is_empty() && !bases.contains(&s) {
                bases.push(s);
            }
        };

        if let Some(ref key) = req.metric_key {
            push_base(self.keys.canonicalize(key));
            push_base(key.clone());
        }
        if let Some(ref path) = req.path {
            push_base(path.clone());
            push_base(self.keys.canonicalize(path));
        }
        if let Some(terminal) = req
            .metric_key
            .as_deref()
            .or(req.path.as_deref())
            .map(terminal_segment)
        {
            push_base(terminal.to_string());
        }

        let mut out: Vec<String> = Vec::new();
        let mut push = |s: String| {
            if !out.contains(&s) {
                out.push(s);
            }
        };

        let step = req.step_key.as_deref().filter(|s| !s.is_empty());
        let evaluator = req.evaluator_key.as_deref().filter(|s| !s.is_empty());

        if let Some(evaluator) = evaluator {
            for base in &bases {
                if let Some(step) = step {
                    push(format!("{}.{}.{}", step, evaluator, base));
                }
                push(format!("{}.{}", evaluator, base));
            }
        }
        if let Some(step) = step {
            for base in &bases {
                push(format!("{}.{}", step, base));
            }
        }
        for base in bases {
            push(base);
        }
        out
    }

    pub fn lookup(&self, req: &LookupRequest, source: &LookupSource<'_>) -> Option<LookupHit> {
        let candidates = self.candidates(req);
        if self.debug {
            tracing::debug!(request = ?req, candidates = ?candidates, "metric key candidates");
        }

        for resolver in &self.chain {
            if let Some((key, value)) = resolver.resolve(&candidates, source) {
                if self.debug {
                    tracing::debug!(strategy = resolver.name(), key = %key, "metric key resolved");
                }
                return Some(LookupHit {
                    strategy: resolver.name(),
                    key,
                    value,
                });
            }
        }

        if self.debug {
            tracing::debug!(request = ?req, "metric key unresolved");
        }
        None
    }
}
