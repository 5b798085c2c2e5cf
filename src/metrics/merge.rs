//! Normalizing and merging statistical summaries.
//!
//! All functions here are pure. `normalize` brings any raw backend leaf to
//! the canonical `StatSummary` shape; `merge` combines two canonical
//! summaries without double counting; `flatten` projects a
//! `{stepKey: {metricKey: rawStat}}` tree to aliased lookup keys.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use super::keys::{reroot_at_marker, MetricKeys};
use crate::models::stats::{
    as_f64, classify_leaf, DistributionBin, FrequencyEntry, LeafShape, StatShape, StatSummary,
    CATEGORICAL_CAP,
};

/// Percentile-style fields. They are not associative under merge, so they
/// are dropped instead of carried forward.
const TRANSIENT_KEYS: &[&str] = &[
    "pcts",
    "pct",
    "iqrs",
    "pscs",
    "hist",
    "quartiles",
    "percentiles",
    "bins",
];

/// Keys consumed into typed fields of `StatSummary`.
const TYPED_KEYS: &[&str] = &[
    "type",
    "count",
    "sum",
    "mean",
    "min",
    "max",
    "range",
    "binSize",
    "bin_size",
    "frequency",
    "freq",
    "rank",
    "unique",
    "uniq",
    "distribution",
];

pub fn normalize(raw: &Value) -> StatSummary {
    let map = match raw {
        Value::Object(map) => map,
        Value::Null => return StatSummary::default(),
        Value::Number(n) => return n.as_f64().map(StatSummary::from_scalar).unwrap_or_default(),
        other => {
            let mut extra = Map::new();
            extra.insert("value".to_string(), other.clone());
            return StatSummary {
                extra,
                ..Default::default()
            };
        }
    };

    let num = |key: &str| map.get(key).and_then(as_f64);

    let mut stat = StatSummary {
        kind: map.get("type").and_then(Value::as_str).map(String::from),
        count: num("count"),
        sum: num("sum"),
        mean: num("mean"),
        min: num("min"),
        max: num("max"),
        range: num("range"),
        bin_size: num("binSize").or_else(|| num("bin_size")),
        frequency: map
            .get("frequency")
            .or_else(|| map.get("freq"))
            .and_then(parse_frequency),
        rank: map.get("rank").and_then(parse_frequency),
        unique: map
            .get("unique")
            .or_else(|| map.get("uniq"))
            .and_then(Value::as_array)
            .cloned(),
        distribution: map.get("distribution").and_then(parse_distribution),
        extra: map
            .iter()
            .filter(|(k, _)| {
                !TYPED_KEYS.contains(&k.as_str()) && !TRANSIENT_KEYS.contains(&k.as_str())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };

    if let Some(buckets) = map.get("hist").and_then(parse_hist) {
        apply_hist(&mut stat, &buckets);
    }

    enforce_shape(&mut stat);
    cap_lists(&mut stat);
    stat
}

/// Combine two canonical summaries. `current == None` yields a copy of
/// `incoming`.
pub fn merge(current: Option<&StatSummary>, incoming: &StatSummary) -> StatSummary {
    let Some(current) = current else {
        let mut copy = incoming.clone();
        ensure_bin_size(&mut copy);
        return copy;
    };

    // A free-text placeholder carries no numbers; a real summary wins.
    match (current.is_string_placeholder(), incoming.is_string_placeholder()) {
        (true, false) if incoming.shape() != StatShape::Empty => return merge(None, incoming),
        (false, true) if current.shape() != StatShape::Empty => return merge(None, current),
        _ => {}
    }

    let count = add(current.count, incoming.count);
    // Counts without a sum would dilute the mean, so the sum is dropped.
    let sum = if covers_count(current) && covers_count(incoming) {
        add(effective_sum(current), effective_sum(incoming))
    } else {
        None
    };
    let mean = match (sum, count) {
        (Some(s), Some(n)) if n > 0.0 => Some(s / n),
        (_, Some(_)) => None,
        _ => current.mean.or(incoming.mean),
    };
    let min = extremum(current.min, incoming.min, f64::min);
    let max = extremum(current.max, incoming.max, f64::max);
    let range = match (min, max) {
        (Some(lo), Some(hi)) => Some(hi - lo),
        _ => current.range.or(incoming.range),
    };

    let mut extra = current.extra.clone();
    for (k, v) in &incoming.extra {
        extra.entry(k.clone()).or_insert_with(|| v.clone());
    }

    let mut merged = StatSummary {
        kind: current.kind.clone().or_else(|| incoming.kind.clone()),
        count,
        sum,
        mean,
        min,
        max,
        range,
        bin_size: current.bin_size.or(incoming.bin_size),
        frequency: merge_counts(current.frequency.as_deref(), incoming.frequency.as_deref()),
        rank: merge_counts(current.rank.as_deref(), incoming.rank.as_deref()),
        unique: merge_unique(current.unique.as_deref(), incoming.unique.as_deref()),
        distribution: merge_distribution(
            current.distribution.as_deref(),
            incoming.distribution.as_deref(),
        ),
        extra,
    };

    if let Some(freq) = merged.frequency.as_mut() {
        sort_by_count_desc(freq);
    }
    enforce_shape(&mut merged);
    cap_lists(&mut merged);
    ensure_bin_size(&mut merged);
    merged
}

/// Repair pass: a summary with a distribution but no bin size gets
/// `(max - min) / buckets` (1 when the range is zero).
pub fn ensure_bin_size(stat: &mut StatSummary) {
    if stat.bin_size.is_some() {
        return;
    }
    let Some(dist) = stat.distribution.as_ref().filter(|d| !d.is_empty()) else {
        return;
    };

    let lo = stat.min.unwrap_or(dist[0].value);
    let hi = stat.max.unwrap_or(dist[dist.len() - 1].value);
    let range = hi - lo;
    stat.bin_size = Some(if range == 0.0 {
        1.0
    } else {
        range / dist.len() as f64
    });
}

/// Project a `{stepKey: {metricKey: rawStat}}` tree onto every lookup key
/// a leaf can be found under. Keys that collide are merged, never
/// overwritten.
pub fn flatten(data: &Value, keys: &MetricKeys) -> BTreeMap<String, StatSummary> {
    let mut out: BTreeMap<String, StatSummary> = BTreeMap::new();
    let Some(steps) = data.as_object() else {
        return out;
    };

    for (step_key, metrics) in steps {
        let mut leaves = Vec::new();
        match classify_leaf(metrics) {
            LeafShape::Branch => collect_leaves(metrics, "", &mut leaves),
            LeafShape::Null => {}
            // A step that directly holds a stat is keyed by the step itself.
            _ => {
                merge_into(&mut out, step_key, &normalize(metrics));
                continue;
            }
        }

        for (metric_key, raw) in leaves {
            let stat = normalize(raw);
            let canonical = keys.canonicalize(&metric_key);
            let composite = format!("{}.{}", step_key, metric_key);

            let mut targets: BTreeSet<String> = BTreeSet::new();
            targets.insert(metric_key.clone());
            targets.insert(canonical.clone());
            for alias in keys.aliases_for(&metric_key, &canonical) {
                targets.insert(format!("{}.{}", step_key, alias));
            }
            if let Some(rerooted) = reroot_at_marker(&composite) {
                targets.insert(rerooted.to_string());
            }
            targets.insert(composite);

            for key in targets {
                merge_into(&mut out, &key, &stat);
            }
        }
    }

    out
}

/// Normalized leaves of one step's metric tree, keyed by dotted path.
pub(crate) fn step_leaves(metrics: &Value) -> Vec<(String, StatSummary)> {
    let mut leaves = Vec::new();
    collect_leaves(metrics, "", &mut leaves);
    leaves
        .into_iter()
        .map(|(key, raw)| (key, normalize(raw)))
        .collect()
}

fn merge_into(out: &mut BTreeMap<String, StatSummary>, key: &str, stat: &StatSummary) {
    let merged = merge(out.get(key), stat);
    out.insert(key.to_string(), merged);
}

fn collect_leaves<'a>(node: &'a Value, path: &str, out: &mut Vec<(String, &'a Value)>) {
    let Some(map) = node.as_object() else {
        return;
    };
    for (k, v) in map {
        let key = if path.is_empty() {
            k.clone()
        } else {
            format!("{}.{}", path, k)
        };
        match classify_leaf(v) {
            LeafShape::Branch => collect_leaves(v, &key, out),
            LeafShape::Null => {}
            _ => out.push((key, v)),
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────

fn add(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x + y),
        (x, None) => x,
        (None, y) => y,
    }
}

fn extremum(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(pick(x, y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Sum as reported, or reconstructed from `mean * count`.
fn effective_sum(stat: &StatSummary) -> Option<f64> {
    stat.sum.or_else(|| match (stat.mean, stat.count) {
        (Some(mean), Some(count)) => Some(mean * count),
        _ => None,
    })
}

/// Every counted observation is reflected in the (effective) sum.
fn covers_count(stat: &StatSummary) -> bool {
    effective_sum(stat).is_some() || stat.count.map_or(true, |n| n == 0.0)
}

fn merge_counts(a: Option<&[FrequencyEntry]>, b: Option<&[FrequencyEntry]>) -> Option<Vec<FrequencyEntry>> {
    if a.is_none() && b.is_none() {
        return None;
    }
    let mut out: Vec<FrequencyEntry> = a.map(<[FrequencyEntry]>::to_vec).unwrap_or_default();
    for entry in b.unwrap_or_default() {
        match out.iter_mut().find(|e| e.value == entry.value) {
            Some(existing) => existing.count += entry.count,
            None => out.push(entry.clone()),
        }
    }
    Some(out)
}

fn merge_unique(a: Option<&[Value]>, b: Option<&[Value]>) -> Option<Vec<Value>> {
    if a.is_none() && b.is_none() {
        return None;
    }
    let mut out: Vec<Value> = a.map(<[Value]>::to_vec).unwrap_or_default();
    for v in b.unwrap_or_default() {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    Some(out)
}

fn merge_distribution(
    a: Option<&[DistributionBin]>,
    b: Option<&[DistributionBin]>,
) -> Option<Vec<DistributionBin>> {
    if a.is_none() && b.is_none() {
        return None;
    }
    let mut out: Vec<DistributionBin> = a.map(<[DistributionBin]>::to_vec).unwrap_or_default();
    for bin in b.unwrap_or_default() {
        match out.iter_mut().find(|e| e.value == bin.value) {
            Some(existing) => existing.count += bin.count,
            None => out.push(*bin),
        }
    }
    out.sort_by(|x, y| x.value.total_cmp(&y.value));
    Some(out)
}

fn sort_by_count_desc(entries: &mut [FrequencyEntry]) {
    entries.sort_by(|a, b| b.count.total_cmp(&a.count));
}

/// A categorical summary keeps only `count` from the numeric side.
fn enforce_shape(stat: &mut StatSummary) {
    if stat.shape() == StatShape::Categorical {
        stat.sum = None;
        stat.mean = None;
        stat.min = None;
        stat.max = None;
        stat.range = None;
        stat.bin_size = None;
        stat.distribution = None;
    }
}

fn cap_lists(stat: &mut StatSummary) {
    if let Some(freq) = stat.frequency.as_mut() {
        freq.truncate(CATEGORICAL_CAP);
    }
    if let Some(rank) = stat.rank.as_mut() {
        sort_by_count_desc(rank);
        rank.truncate(CATEGORICAL_CAP);
    }
    if let Some(unique) = stat.unique.as_mut() {
        unique.truncate(CATEGORICAL_CAP);
    }
    if let Some(dist) = stat.distribution.as_mut() {
        dist.truncate(CATEGORICAL_CAP);
    }
}

/// Accepts `[{value, count}]`, `[{value, frequency}]` and `{value: count}`.
fn parse_frequency(raw: &Value) -> Option<Vec<FrequencyEntry>> {
    match raw {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| {
                    let obj = item.as_object()?;
                    let count = obj
                        .get("count")
                        .or_else(|| obj.get("frequency"))
                        .and_then(as_f64)?;
                    Some(FrequencyEntry {
                        value: obj.get("value").cloned().unwrap_or(Value::Null),
                        count,
                    })
                })
                .collect(),
        ),
        Value::Object(map) => Some(
            map.iter()
                .filter_map(|(k, v)| {
                    Some(FrequencyEntry {
                        value: Value::String(k.clone()),
                        count: as_f64(v)?,
                    })
                })
                .collect(),
        ),
        _ => None,
    }
}

fn parse_distribution(raw: &Value) -> Option<Vec<DistributionBin>> {
    let items = raw.as_array()?;
    let mut bins: Vec<DistributionBin> = items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            Some(DistributionBin {
                value: obj.get("value").and_then(as_f64)?,
                count: obj.get("count").and_then(as_f64).unwrap_or(0.0),
            })
        })
        .collect();
    bins.sort_by(|a, b| a.value.total_cmp(&b.value));
    Some(bins)
}

struct HistBucket {
    start: f64,
    end: Option<f64>,
    count: f64,
}

/// Buckets as `{interval: [lo, hi], count}`, `{edges: [lo, hi], count}`,
/// `{start, end, count}` or `{value, count}`.
fn parse_hist(raw: &Value) -> Option<Vec<HistBucket>> {
    let items = raw.as_array()?;
    let mut buckets: Vec<HistBucket> = items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let count = obj
                .get("count")
                .or_else(|| obj.get("freq"))
                .and_then(as_f64)
                .unwrap_or(0.0);
            let pair = obj
                .get("interval")
                .or_else(|| obj.get("edges"))
                .and_then(Value::as_array);
            let (start, end) = match pair {
                Some(edges) if !edges.is_empty() => (
                    as_f64(&edges[0])?,
                    edges.get(1).and_then(as_f64),
                ),
                _ => (
                    obj.get("start").or_else(|| obj.get("value")).and_then(as_f64)?,
                    obj.get("end").and_then(as_f64),
                ),
            };
            Some(HistBucket { start, end, count })
        })
        .collect();
    if buckets.is_empty() {
        return None;
    }
    buckets.sort_by(|a, b| a.start.total_cmp(&b.start));
    Some(buckets)
}

fn apply_hist(stat: &mut StatSummary, buckets: &[HistBucket]) {
    if stat.distribution.is_none() {
        stat.distribution = Some(
            buckets
                .iter()
                .map(|b| DistributionBin {
                    value: b.start,
                    count: b.count,
                })
                .collect(),
        );
    }
    let first = &buckets[0];
    let last = &buckets[buckets.len() - 1];
    if stat.bin_size.is_none() {
        if let Some(end) = first.end {
            stat.bin_size = Some(end - first.start);
        }
    }
    if stat.min.is_none() {
        stat.min = Some(first.start);
    }
    if stat.max.is_none() {
        stat.max = Some(last.end.unwrap_or(last.start));
    }
}
