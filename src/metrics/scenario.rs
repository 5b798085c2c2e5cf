//! Scenario metric batcher: fetch, classify, repair, re-fetch once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::aggregate::ScenarioMetricData;
use super::keys::MetricKeys;
use super::processor::{FlushOptions, MetricProcessor, RefreshLedger, REASON_MISSING_SCENARIO_METRIC};
use crate::api::EvalBackend;
use crate::batch::BatchLoader;
use crate::errors::BackendError;
use crate::models::metric::{EvaluationType, MetricQueryFilter, MetricRecord, MetricScope};

/// Loads [`ScenarioMetricData`] for scenarios of one run. Scenarios with no
/// metrics after all repair attempts are left out of the result, which the
/// coalescer reports as `None`.
pub struct ScenarioMetricsLoader {
    backend: Arc<dyn EvalBackend>,
    ledger: Arc<RefreshLedger>,
    evaluation_types: Arc<DashMap<String, EvaluationType>>,
    keys: MetricKeys,
    project_id: String,
    run_id: String,
}

impl ScenarioMetricsLoader {
    pub fn new(
        backend: Arc<dyn EvalBackend>,
        ledger: Arc<RefreshLedger>,
        evaluation_types: Arc<DashMap<String, EvaluationType>>,
        keys: MetricKeys,
        project_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            ledger,
            evaluation_types,
            keys,
            project_id: project_id.into(),
            run_id: run_id.into(),
        }
    }

    fn processor(&self) -> MetricProcessor {
        let evaluation_type = self
            .evaluation_types
            .get(&self.run_id)
            .map(|t| *t)
            .unwrap_or_default();
        MetricProcessor::new(
            self.backend.clone(),
            self.ledger.clone(),
            self.project_id.clone(),
            self.run_id.clone(),
            evaluation_type,
        )
    }

    async fn fetch(&self, scenario_ids: &[String]) -> Result<Vec<MetricRecord>, BackendError> {
        self.backend
            .query_metrics(
                &self.project_id,
                MetricQueryFilter {
                    scenario_ids: Some(scenario_ids.to_vec()),
                    run_ids: vec![self.run_id.clone()],
                },
            )
            .await
    }

    /// Classify every record and group the requested ones by scenario.
    /// Records for scenarios outside `requested` are ignored.
    fn process(
        processor: &mut MetricProcessor,
        records: Vec<MetricRecord>,
        requested: &BTreeSet<String>,
    ) -> BTreeMap<String, Vec<MetricRecord>> {
        let mut grouped: BTreeMap<String, Vec<MetricRecord>> = BTreeMap::new();
        for record in records {
            let Some(sid) = record.scenario_id.clone() else {
                continue;
            };
            if !requested.contains(&sid) {
                continue;
            }
            processor.process_metric(&record, MetricScope::Scenario);
            grouped.entry(sid).or_default().push(record);
        }
        grouped
    }

    async fn scenario_statuses(&self, scenario_ids: &[String]) -> HashMap<String, Option<String>> {
        match self
            .backend
            .query_scenarios(&self.project_id, &self.run_id, scenario_ids)
            .await
        {
            Ok(scenarios) => scenarios
                .into_iter()
                .map(|s| (s.id, s.status.map(|st| st.trim().to_ascii_lowercase())))
                .collect(),
            Err(e) => {
                tracing::warn!(
                    project_id = %self.project_id,
                    run_id = %self.run_id,
                    scenario_ids = ?scenario_ids,
                    error = %e,
                    "failed to load scenario statuses"
                );
                HashMap::new()
            }
        }
    }

    fn mark_gaps(
        processor: &mut MetricProcessor,
        requested: &BTreeSet<String>,
        grouped: &BTreeMap<String, Vec<MetricRecord>>,
        statuses: &HashMap<String, Option<String>>,
    ) {
        for sid in requested.iter().filter(|sid| !grouped.contains_key(*sid)) {
            let status = statuses.get(sid).and_then(|s| s.as_deref());
            processor.mark_scenario_gap(sid, REASON_MISSING_SCENARIO_METRIC, status);
        }
    }

    /// Delete stale records. Returns whether anything was deleted.
    async fn delete_stale(&self, metric_ids: &[String]) -> bool {
        if metric_ids.is_empty() {
            return false;
        }
        match self.backend.delete_metrics(&self.project_id, metric_ids).await {
            Ok(()) => {
                tracing::info!(
                    project_id = %self.project_id,
                    run_id = %self.run_id,
                    metric_ids = ?metric_ids,
                    "deleted stale scenario metrics"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    project_id = %self.project_id,
                    run_id = %self.run_id,
                    metric_ids = ?metric_ids,
                    error = %e,
                    "failed to delete stale scenario metrics"
                );
                false
            }
        }
    }
}

#[async_trait]
impl BatchLoader for ScenarioMetricsLoader {
    type Key = String;
    type Value = Arc<ScenarioMetricData>;

    fn key_id(&self, key: &String) -> String {
        key.clone()
    }

    async fn load(&self, keys: Vec<String>) -> Result<HashMap<String, Arc<ScenarioMetricData>>, BackendError> {
        let requested: BTreeSet<String> = keys.iter().cloned().collect();

        let records = self.fetch(&keys).await?;
        let mut processor = self.processor();
        let mut grouped = Self::process(&mut processor, records, &requested);

        let empty: Vec<String> = requested
            .iter()
            .filter(|sid| !grouped.contains_key(*sid))
            .cloned()
            .collect();
        let statuses = if empty.is_empty() {
            HashMap::new()
        } else {
            self.scenario_statuses(&empty).await
        };
        Self::mark_gaps(&mut processor, &requested, &grouped, &statuses);

        let flush = processor
            .flush(FlushOptions {
                trigger_refresh: true,
                is_temporal_only: false,
            })
            .await;
        let deleted = self.delete_stale(&flush.stale_metric_ids).await;

        if deleted || flush.refreshed {
            match self.fetch(&keys).await {
                Ok(records) => {
                    let mut retry = self.processor();
                    grouped = Self::process(&mut retry, records, &requested);
                    Self::mark_gaps(&mut retry, &requested, &grouped, &statuses);
                    retry.flush(FlushOptions::default()).await;
                }
                Err(e) => tracing::warn!(
                    project_id = %self.project_id,
                    run_id = %self.run_id,
                    error = %e,
                    "re-fetch after metric refresh failed, keeping first result"
                ),
            }
        }

        let missing = requested.len() - grouped.len();
        if missing > 0 {
            tracing::debug!(run_id = %self.run_id, missing, "scenarios without metrics");
        }

        Ok(grouped
            .into_iter()
            .map(|(sid, records)| {
                let data = ScenarioMetricData::build(sid.clone(), records, &self.keys);
                (sid, Arc::new(data))
            })
            .collect())
    }
}
