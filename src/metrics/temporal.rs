//! Time series of run-level stats for streaming evaluations.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::Serialize;

use super::keys::MetricKeys;
use super::merge::{merge, step_leaves};
use crate::models::metric::MetricRecord;
use crate::models::stats::StatSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemporalMetricPoint {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub stats: StatSummary,
}

/// Series keyed by `stepKey:canonicalMetricKey`, each sorted ascending.
pub type SeriesMap = BTreeMap<String, Vec<TemporalMetricPoint>>;

pub fn series_key(step_key: &str, canonical_key: &str) -> String {
    format!("{}:{}", step_key, canonical_key)
}

/// Build every series from the timestamped run-level records. Points with
/// the same key and timestamp are merged.
pub fn build_series(records: &[MetricRecord], keys: &MetricKeys) -> SeriesMap {
    let mut by_key: BTreeMap<String, BTreeMap<i64, StatSummary>> = BTreeMap::new();

    for record in records.iter().filter(|r| r.is_temporal()) {
        let (Some(ts), Some(steps)) = (record.timestamp_ms(), record.steps()) else {
            continue;
        };
        for (step_key, metrics) in steps {
            for (metric_key, stat) in step_leaves(metrics) {
                let key = series_key(step_key, &keys.canonicalize(&metric_key));
                let points = by_key.entry(key).or_default();
                let merged = merge(points.get(&ts), &stat);
                points.insert(ts, merged);
            }
        }
    }

    by_key
        .into_iter()
        .map(|(key, points)| {
            let series = points
                .into_iter()
                .map(|(timestamp, stats)| TemporalMetricPoint { timestamp, stats })
                .collect();
            (key, series)
        })
        .collect()
}

/// Latest point at or before `at_ms`.
pub fn stats_at(series: &[TemporalMetricPoint], at_ms: i64) -> Option<&TemporalMetricPoint> {
    let idx = series.partition_point(|p| p.timestamp <= at_ms);
    idx.checked_sub(1).map(|i| &series[i])
}

/// Series per run, retained for point-in-time lookups.
#[derive(Debug, Default)]
pub struct TemporalStore {
    runs: DashMap<String, SeriesMap>,
}

impl TemporalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_run(&self, run_id: &str, series: SeriesMap) {
        if series.is_empty() {
            self.runs.remove(run_id);
        } else {
            self.runs.insert(run_id.to_string(), series);
        }
    }

    pub fn series(&self, run_id: &str, key: &str) -> Option<Vec<TemporalMetricPoint>> {
        self.runs.get(run_id)?.get(key).cloned()
    }

    pub fn series_keys(&self, run_id: &str) -> Vec<String> {
        self.runs
            .get(run_id)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stats of `key` as they were at `at_ms`, e.g. when a scenario ran.
    pub fn stats_at(&self, run_id: &str, key: &str, at_ms: i64) -> Option<StatSummary> {
        let run = self.runs.get(run_id)?;
        let series = run.get(key)?;
        stats_at(series, at_ms).map(|p| p.stats.clone())
    }

    pub fn clear_run(&self, run_id: &str) {
        self.runs.remove(run_id);
    }

    pub fn clear(&self) {
        self.runs.clear();
    }
}
