//! Canonical statistical summary and the boundary parser for raw leaves.
//!
//! Backend metric leaves come in several historical shapes. Everything is
//! classified here once (`LeafShape`) so business logic never probes raw
//! JSON keys directly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum length of any categorical or distribution list.
pub const CATEGORICAL_CAP: usize = 20;

/// Keys allowed next to a bare `value` in a legacy leaf.
const LEGACY_ALLOWED_KEYS: &[&str] = &[
    "value",
    "count",
    "confidence",
    "support",
    "stepKey",
    "step_key",
    "timestamp",
];

/// Keys that mark an object as a statistical leaf rather than a branch.
const STAT_MARKER_KEYS: &[&str] = &[
    "count",
    "sum",
    "mean",
    "min",
    "max",
    "range",
    "binSize",
    "frequency",
    "freq",
    "rank",
    "unique",
    "uniq",
    "distribution",
    "hist",
    "value",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyEntry {
    pub value: Value,
    pub count: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributionBin {
    pub value: f64,
    pub count: f64,
}

/// Canonical statistical aggregate for one metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatSummary {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<Vec<FrequencyEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<Vec<FrequencyEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<Vec<DistributionBin>>,
    /// Passthrough fields (`value`, `confidence`, ...) not covered above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatShape {
    Numeric,
    Categorical,
    Empty,
}

impl StatSummary {
    /// Summary of a single observed number.
    pub fn from_scalar(v: f64) -> Self {
        Self {
            count: Some(1.0),
            sum: Some(v),
            mean: Some(v),
            min: Some(v),
            max: Some(v),
            range: Some(0.0),
            ..Default::default()
        }
    }

    pub fn shape(&self) -> StatShape {
        let categorical = self.frequency.is_some() || self.rank.is_some() || self.unique.is_some();
        let numeric = self.sum.is_some()
            || self.mean.is_some()
            || self.min.is_some()
            || self.max.is_some()
            || self.distribution.is_some();
        if categorical {
            StatShape::Categorical
        } else if numeric || self.count.is_some() {
            StatShape::Numeric
        } else {
            StatShape::Empty
        }
    }

    /// `{type: "string", count: N}` with nothing else: free-text metrics
    /// cannot be aggregated, so the backend only reports how many exist.
    pub fn is_string_placeholder(&self) -> bool {
        self.kind.as_deref() == Some("string")
            && self.sum.is_none()
            && self.mean.is_none()
            && self.frequency.is_none()
            && self.rank.is_none()
            && self.unique.is_none()
            && self.distribution.is_none()
            && !self.extra.contains_key("value")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Classification of a raw leaf as found in backend payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafShape {
    /// Pre-aggregation shape `{value: <scalar>, count?, ...}` that needs a
    /// backend recompute.
    LegacyValue,
    /// `{type: "string", count}` placeholder for free-text metrics.
    StringPlaceholder,
    /// Any other object carrying stat fields (current or aliased).
    Stat,
    /// A bare number/bool/string.
    Scalar,
    /// An object that is a branch, not a leaf.
    Branch,
    Null,
}

pub fn classify_leaf(value: &Value) -> LeafShape {
    match value {
        Value::Null => LeafShape::Null,
        Value::Object(map) => {
            if is_legacy_value_leaf(map) {
                LeafShape::LegacyValue
            } else if map.get("type").and_then(Value::as_str) == Some("string")
                && !map.contains_key("value")
                && !map.contains_key("frequency")
                && !map.contains_key("freq")
            {
                LeafShape::StringPlaceholder
            } else if STAT_MARKER_KEYS.iter().any(|k| map.contains_key(*k)) {
                LeafShape::Stat
            } else {
                LeafShape::Branch
            }
        }
        _ => LeafShape::Scalar,
    }
}

/// `{value: 3, count: 10}` is legacy; `{value: 3, frequency: [...]}` and
/// `{value: 3, unexpectedKey: "x"}` are not.
pub fn is_legacy_value_leaf(map: &Map<String, Value>) -> bool {
    let Some(value) = map.get("value") else {
        return false;
    };
    if value.is_object() {
        return false;
    }
    if ["frequency", "rank", "distribution"]
        .iter()
        .any(|k| map.contains_key(*k))
    {
        return false;
    }
    map.keys()
        .all(|k| LEGACY_ALLOWED_KEYS.contains(&k.as_str()))
}

/// True when any object nested anywhere under `value` is a legacy leaf.
pub fn contains_legacy_leaf(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            is_legacy_value_leaf(map) || map.values().any(contains_legacy_leaf)
        }
        _ => false,
    }
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_legacy_leaf_detection() {
        assert!(is_legacy_value_leaf(&obj(json!({"value": 3, "count": 10}))));
        assert!(!is_legacy_value_leaf(&obj(json!({"value": 3, "frequency": []}))));
        assert!(!is_legacy_value_leaf(&obj(json!({"value": 3, "unexpectedKey": "x"}))));
        assert!(!is_legacy_value_leaf(&obj(json!({"value": {"nested": 1}}))));
        assert!(!is_legacy_value_leaf(&obj(json!({"count": 3}))));
        assert!(is_legacy_value_leaf(&obj(json!({"value": true, "step_key": "s"}))));
    }

    #[test]
    fn test_contains_legacy_leaf_nested() {
        let data = json!({"step1": {"score": {"value": 0.9}}});
        assert!(contains_legacy_leaf(&data));

        let data = json!({"step1": {"score": {"count": 1, "mean": 0.9}}});
        assert!(!contains_legacy_leaf(&data));
    }

    #[test]
    fn test_classify_leaf() {
        assert_eq!(classify_leaf(&json!({"value": 1})), LeafShape::LegacyValue);
        assert_eq!(
            classify_leaf(&json!({"type": "string", "count": 4})),
            LeafShape::StringPlaceholder
        );
        assert_eq!(classify_leaf(&json!({"freq": []})), LeafShape::Stat);
        assert_eq!(classify_leaf(&json!({"score": {"count": 1}})), LeafShape::Branch);
        assert_eq!(classify_leaf(&json!(0.5)), LeafShape::Scalar);
        assert_eq!(classify_leaf(&Value::Null), LeafShape::Null);
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let stat = StatSummary {
            bin_size: Some(0.5),
            kind: Some("numeric/continuous".into()),
            ..Default::default()
        };
        let v = stat.to_value();
        assert_eq!(v["binSize"], 0.5);
        assert_eq!(v["type"], "numeric/continuous");
        assert!(v.get("sum").is_none());
    }

    #[test]
    fn test_string_placeholder() {
        let stat: StatSummary = serde_json::from_value(json!({"type": "string", "count": 3})).unwrap();
        assert!(stat.is_string_placeholder());
        let stat: StatSummary =
            serde_json::from_value(json!({"type": "string", "count": 3, "value": "ok"})).unwrap();
        assert!(!stat.is_string_placeholder());
    }
}
