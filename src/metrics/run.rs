//! Run metric batcher and the run-level stats projection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use super::keys::MetricKeys;
use super::merge::{flatten, merge};
use super::processor::{FlushOptions, MetricProcessor, RefreshLedger, REASON_MISSING_RUN_LEVEL_ENTRY};
use super::temporal::{build_series, TemporalStore};
use crate::api::EvalBackend;
use crate::batch::BatchLoader;
use crate::errors::BackendError;
use crate::models::metric::{EvaluationType, MetricQueryFilter, MetricRecord, MetricScope};
use crate::models::stats::StatSummary;

/// Metric key ⇢ merged stats for one run.
pub type RunLevelStatsMap = BTreeMap<String, StatSummary>;

/// Everything fetched for one run after reconciliation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetricsSnapshot {
    pub run_id: String,
    pub records: Vec<MetricRecord>,
    pub has_static: bool,
    /// Streaming evaluation with no static run-level record yet.
    pub is_temporal_only: bool,
}

impl RunMetricsSnapshot {
    /// Merge static run-level records, then fill keys they do not cover
    /// from scenario records and, when asked, from the temporal records.
    pub fn run_level_stats(&self, include_temporal: bool, keys: &MetricKeys) -> RunLevelStatsMap {
        let mut stats = merged_flat(self.records.iter().filter(|r| r.is_static_run_level()), keys);
        let covered: BTreeSet<String> = stats.keys().cloned().collect();

        let mut fill = merged_flat(self.records.iter().filter(|r| !r.is_run_level()), keys);
        if include_temporal {
            let temporal = merged_flat(self.records.iter().filter(|r| r.is_temporal()), keys);
            for (key, stat) in temporal {
                let merged = merge(fill.get(&key), &stat);
                fill.insert(key, merged);
            }
        }

        for (key, stat) in fill {
            if !covered.contains(&key) {
                stats.insert(key, stat);
            }
        }
        stats
    }
}

fn merged_flat<'a>(records: impl Iterator<Item = &'a MetricRecord>, keys: &MetricKeys) -> RunLevelStatsMap {
    let mut out = RunLevelStatsMap::new();
    for record in records {
        for (key, stat) in flatten(&record.data, keys) {
            let merged = merge(out.get(&key), &stat);
            out.insert(key, merged);
        }
    }
    out
}

/// Streaming evaluations may only ever write timestamped run-level
/// records; bootstrapping a static one would never succeed.
pub fn is_temporal_only(records: &[MetricRecord], evaluation_type: EvaluationType) -> bool {
    let has_static = records.iter().any(MetricRecord::is_static_run_level);
    let has_temporal = records.iter().any(MetricRecord::is_temporal);
    !has_static && (has_temporal || evaluation_type.is_streaming())
}

pub struct RunMetricsLoader {
    backend: Arc<dyn EvalBackend>,
    ledger: Arc<RefreshLedger>,
    evaluation_types: Arc<DashMap<String, EvaluationType>>,
    temporal: Arc<TemporalStore>,
    keys: MetricKeys,
    project_id: String,
}

impl RunMetricsLoader {
    pub fn new(
        backend: Arc<dyn EvalBackend>,
        ledger: Arc<RefreshLedger>,
        evaluation_types: Arc<DashMap<String, EvaluationType>>,
        temporal: Arc<TemporalStore>,
        keys: MetricKeys,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            ledger,
            evaluation_types,
            temporal,
            keys,
            project_id: project_id.into(),
        }
    }

    fn evaluation_type(&self, run_id: &str) -> EvaluationType {
        self.evaluation_types
            .get(run_id)
            .map(|t| *t)
            .unwrap_or_default()
    }

    async fn fetch(&self, run_ids: &[String]) -> Result<Vec<MetricRecord>, BackendError> {
        self.backend
            .query_metrics(
                &self.project_id,
                MetricQueryFilter {
                    scenario_ids: None,
                    run_ids: run_ids.to_vec(),
                },
            )
            .await
    }

    fn classify(processor: &mut MetricProcessor, records: &[MetricRecord]) {
        let mut has_static = false;
        for record in records.iter().filter(|r| r.is_static_run_level()) {
            has_static = true;
            processor.process_metric(record, MetricScope::Run);
        }
        if !has_static {
            processor.mark_run_level_gap(REASON_MISSING_RUN_LEVEL_ENTRY);
        }
    }

    async fn reconcile(&self, run_id: &str, mut records: Vec<MetricRecord>) -> RunMetricsSnapshot {
        let evaluation_type = self.evaluation_type(run_id);
        let temporal_only = is_temporal_only(&records, evaluation_type);

        let mut processor = MetricProcessor::new(
            self.backend.clone(),
            self.ledger.clone(),
            self.project_id.clone(),
            run_id,
            evaluation_type,
        );
        Self::classify(&mut processor, &records);

        let flush = processor
            .flush(FlushOptions {
                trigger_refresh: true,
                is_temporal_only: temporal_only,
            })
            .await;

        let mut deleted = false;
        if !flush.stale_metric_ids.is_empty() {
            match self
                .backend
                .delete_metrics(&self.project_id, &flush.stale_metric_ids)
                .await
            {
                Ok(()) => deleted = true,
                Err(e) => tracing::warn!(
                    project_id = %self.project_id,
                    run_id,
                    metric_ids = ?flush.stale_metric_ids,
                    error = %e,
                    "failed to delete stale run metrics"
                ),
            }
        }

        if deleted || flush.refreshed {
            match self.fetch(&[run_id.to_string()]).await {
                Ok(fresh) => {
                    records = fresh;
                    let mut retry = MetricProcessor::new(
                        self.backend.clone(),
                        self.ledger.clone(),
                        self.project_id.clone(),
                        run_id,
                        evaluation_type,
                    );
                    Self::classify(&mut retry, &records);
                    retry
                        .flush(FlushOptions {
                            trigger_refresh: false,
                            is_temporal_only: is_temporal_only(&records, evaluation_type),
                        })
                        .await;
                }
                Err(e) => tracing::warn!(
                    project_id = %self.project_id,
                    run_id,
                    error = %e,
                    "re-fetch after run metric refresh failed, keeping first result"
                ),
            }
        }

        self.temporal.replace_run(run_id, build_series(&records, &self.keys));

        RunMetricsSnapshot {
            run_id: run_id.to_string(),
            has_static: records.iter().any(MetricRecord::is_static_run_level),
            is_temporal_only: is_temporal_only(&records, evaluation_type),
            records,
        }
    }
}

#[async_trait]
impl BatchLoader for RunMetricsLoader {
    type Key = String;
    type Value = Arc<RunMetricsSnapshot>;

    fn key_id(&self, key: &String) -> String {
        key.clone()
    }

    async fn load(&self, keys: Vec<String>) -> Result<HashMap<String, Arc<RunMetricsSnapshot>>, BackendError> {
        let records = self.fetch(&keys).await?;

        let mut by_run: BTreeMap<String, Vec<MetricRecord>> =
            keys.iter().map(|k| (k.clone(), Vec::new())).collect();
        for record in records {
            if let Some(bucket) = by_run.get_mut(&record.run_id) {
                bucket.push(record);
            }
        }

        let mut out = HashMap::new();
        for (run_id, records) in by_run {
            let snapshot = self.reconcile(&run_id, records).await;
            out.insert(run_id, Arc::new(snapshot));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metric::RefreshTarget;
    use crate::testing::{record, FakeBackend};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        backend: Arc<FakeBackend>,
        ledger: Arc<RefreshLedger>,
        types: Arc<DashMap<String, EvaluationType>>,
        temporal: Arc<TemporalStore>,
    }

    impl Harness {
        fn new(backend: FakeBackend) -> Self {
            Self {
                backend: Arc::new(backend),
                ledger: Arc::new(RefreshLedger::new(Duration::from_secs(5))),
                types: Arc::new(DashMap::new()),
                temporal: Arc::new(TemporalStore::new()),
            }
        }

        fn loader(&self) -> RunMetricsLoader {
            RunMetricsLoader::new(
                self.backend.clone(),
                self.ledger.clone(),
                self.types.clone(),
                self.temporal.clone(),
                MetricKeys::default(),
                "p1",
            )
        }
    }

    fn timestamped(mut r: MetricRecord, ts: i64) -> MetricRecord {
        r.timestamp = Some(json!(ts));
        r
    }

    #[tokio::test]
    async fn test_static_run_record_needs_no_refresh() {
        let h = Harness::new(FakeBackend::with_metrics(vec![record(
            Some("run-m"),
            None,
            None,
            json!({"judge": {"score": {"count": 4, "sum": 2, "mean": 0.5}}}),
        )]));

        let out = h.loader().load(vec!["r1".into()]).await.unwrap();
        let snapshot = &out["r1"];
        assert!(snapshot.has_static);
        assert!(!snapshot.is_temporal_only);
        assert_eq!(h.backend.calls(), vec!["query_metrics".to_string()]);

        let stats = snapshot.run_level_stats(false, &MetricKeys::default());
        assert_eq!(stats["judge.score"].mean, Some(0.5));
    }

    #[tokio::test]
    async fn test_missing_run_entry_bootstraps_once() {
        let h = Harness::new(FakeBackend::default());

        h.loader().load(vec!["r1".into()]).await.unwrap();
        h.loader().load(vec!["r1".into()]).await.unwrap();

        assert_eq!(h.backend.count_calls("refresh:run"), 1);
        assert_eq!(h.backend.count_calls("query_metrics"), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_refetches_when_backend_produces_entry() {
        let h = Harness::new(FakeBackend::default());
        h.backend.on_refresh(|target, store| match target {
            RefreshTarget::Run { .. } => {
                let fresh = record(Some("run-m"), None, None, json!({"judge": {"score": {"count": 1, "sum": 1}}}));
                store.push(fresh.clone());
                vec![fresh]
            }
            _ => Vec::new(),
        });

        let out = h.loader().load(vec!["r1".into()]).await.unwrap();
        assert!(out["r1"].has_static);
        assert_eq!(
            h.backend.calls(),
            vec![
                "query_metrics".to_string(),
                "refresh:run".to_string(),
                "query_metrics".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_temporal_only_run_never_bootstraps() {
        let h = Harness::new(FakeBackend::with_metrics(vec![
            timestamped(record(Some("t1"), None, None, json!({"judge": {"score": {"count": 1, "sum": 1}}})), 1_000_000_000_000),
            timestamped(record(Some("t2"), None, None, json!({"judge": {"score": {"count": 1, "sum": 3}}})), 2_000_000_000_000),
        ]));

        let out = h.loader().load(vec!["r1".into()]).await.unwrap();
        assert!(out["r1"].is_temporal_only);
        assert_eq!(h.backend.count_calls("refresh"), 0);
        assert!(!h.ledger.bootstrap_attempted("r1"));

        let series = h.temporal.series("r1", "judge:score").unwrap();
        assert_eq!(series.len(), 2);

        let without = out["r1"].run_level_stats(false, &MetricKeys::default());
        assert!(without.is_empty());
        let with = out["r1"].run_level_stats(true, &MetricKeys::default());
        assert_eq!(with["judge.score"].count, Some(2.0));
        assert_eq!(with["judge.score"].sum, Some(4.0));
    }

    #[tokio::test]
    async fn test_online_run_without_records_is_temporal_only() {
        let h = Harness::new(FakeBackend::default());
        h.types.insert("r1".into(), EvaluationType::Online);

        let out = h.loader().load(vec!["r1".into()]).await.unwrap();
        assert!(out["r1"].is_temporal_only);
        assert_eq!(h.backend.count_calls("refresh"), 0);
    }

    #[test]
    fn test_scenario_records_fill_uncovered_keys_only() {
        let snapshot = RunMetricsSnapshot {
            run_id: "r1".into(),
            records: vec![
                record(Some("run"), None, None, json!({"judge": {"score": {"count": 10, "sum": 5}}})),
                record(Some("m1"), Some("s1"), Some("success"), json!({"judge": {"score": {"count": 1, "sum": 1}, "latency": {"count": 1, "sum": 2}}})),
                record(Some("m2"), Some("s2"), Some("success"), json!({"judge": {"latency": {"count": 1, "sum": 4}}})),
            ],
            has_static: true,
            is_temporal_only: false,
        };

        let stats = snapshot.run_level_stats(false, &MetricKeys::default());
        assert_eq!(stats["judge.score"].count, Some(10.0));
        assert_eq!(stats["judge.latency"].sum, Some(6.0));
        assert_eq!(stats["judge.latency"].mean, Some(3.0));
    }
}
