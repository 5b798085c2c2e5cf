//! Per-scenario metric view assembled from raw metric records.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use super::keys::MetricKeys;
use super::merge::flatten;
use crate::models::metric::MetricRecord;
use crate::models::stats::{as_f64, StatSummary};

/// Key under which derived aggregates live in `raw`.
pub const ACC_KEY: &str = "acc";

/// Sub-objects summed into `acc`.
const ACCUMULATED_KINDS: &[&str] = &["costs", "duration", "tokens", "errors"];

/// Derived (never persisted) metric view of one scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetricData {
    pub scenario_id: String,
    pub metrics: Vec<MetricRecord>,
    /// Deep-merged `data` payloads plus the derived `acc` node.
    pub raw: Map<String, Value>,
    /// Single-level projection of `raw` for candidate-key lookups.
    pub flat: BTreeMap<String, StatSummary>,
}

impl ScenarioMetricData {
    pub fn build(scenario_id: impl Into<String>, metrics: Vec<MetricRecord>, keys: &MetricKeys) -> Self {
        let mut merged = Value::Object(Map::new());
        for record in &metrics {
            if record.data.is_object() {
                deep_merge(&mut merged, &record.data);
            }
        }

        let mut flat = flatten(&merged, keys);
        let acc = derive_accumulators(&merged);

        let mut raw = match merged {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        if !acc.is_empty() {
            for (kind, fields) in &acc {
                for (field, total) in fields {
                    flat.insert(
                        format!("{}.{}.{}", ACC_KEY, kind, field),
                        StatSummary::from_scalar(*total),
                    );
                }
            }
            raw.insert(ACC_KEY.to_string(), accumulators_to_value(&acc));
        }

        Self {
            scenario_id: scenario_id.into(),
            metrics,
            raw,
            flat,
        }
    }

    pub fn raw_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}

/// Recursive object merge; non-object values in `patch` replace the target.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                deep_merge(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => {
            *target = patch.clone();
        }
    }
}

type Accumulators = BTreeMap<String, BTreeMap<String, f64>>;

/// Walk the payload and sum every `costs`/`duration`/`tokens`/`errors`
/// sub-object found at any depth, skipping existing `acc` nodes.
pub fn derive_accumulators(raw: &Value) -> Accumulators {
    let mut acc = Accumulators::new();
    walk(raw, &mut acc);
    acc
}

fn walk(node: &Value, acc: &mut Accumulators) {
    let Some(map) = node.as_object() else {
        return;
    };
    for (key, value) in map {
        if key == ACC_KEY {
            continue;
        }
        if ACCUMULATED_KINDS.contains(&key.as_str()) {
            accumulate(key, value, acc);
        } else {
            walk(value, acc);
        }
    }
}

fn accumulate(kind: &str, value: &Value, acc: &mut Accumulators) {
    if let Some(n) = leaf_number(value) {
        *acc.entry(kind.to_string())
            .or_default()
            .entry("total".to_string())
            .or_insert(0.0) += n;
        return;
    }
    let Some(map) = value.as_object() else {
        return;
    };
    // Prefer the cumulative view when both are reported.
    let fields = map
        .get("cumulative")
        .or_else(|| map.get("incremental"))
        .and_then(Value::as_object)
        .unwrap_or(map);

    for (field, v) in fields {
        if let Some(n) = leaf_number(v) {
            *acc.entry(kind.to_string())
                .or_default()
                .entry(field.clone())
                .or_insert(0.0) += n;
        }
    }
}

/// Number carried by a leaf: a bare number, or a stat's `sum`, `mean` or
/// `value`.
fn leaf_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) => map
            .get("sum")
            .or_else(|| map.get("mean"))
            .or_else(|| map.get("value"))
            .and_then(as_f64),
        _ => None,
    }
}

fn accumulators_to_value(acc: &Accumulators) -> Value {
    let mut out = Map::new();
    for (kind, fields) in acc {
        let fields: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        out.insert(kind.clone(), Value::Object(fields));
    }
    Value::Object(out)
}
