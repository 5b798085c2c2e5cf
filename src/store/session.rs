//! Session context owning every cache the dashboard reads through.

use std::sync::Arc;

use dashmap::DashMap;

use super::query_cache::{Invalidation, QueryCache};
use crate::api::{EvalBackend, HttpBackend};
use crate::batch::{AnnotationLoader, Coalescer, StepLoader, TestcaseLoader, TraceLoader};
use crate::config::{Config, SessionConfig};
use crate::errors::{BackendError, LoadError};
use crate::metrics::aggregate::ScenarioMetricData;
use crate::metrics::keys::MetricKeys;
use crate::metrics::lookup::{LookupHit, LookupRequest, LookupSource, MetricLookup};
use crate::metrics::processor::RefreshLedger;
use crate::metrics::run::{RunLevelStatsMap, RunMetricsLoader, RunMetricsSnapshot};
use crate::metrics::scenario::ScenarioMetricsLoader;
use crate::metrics::temporal::{TemporalMetricPoint, TemporalStore};
use crate::models::annotation::{Annotation, AnnotationLink};
use crate::models::metric::EvaluationType;
use crate::models::stats::StatSummary;
use crate::models::step::{StepResult, Testcase};
use crate::models::trace::{canonical_trace_id, TraceTree};

type ScenarioEntry = Option<Arc<ScenarioMetricData>>;

/// Owns the batchers, caches and refresh bookkeeping for one project.
///
/// Nothing here is global: dropping the session drops every cache.
pub struct EvalSession {
    backend: Arc<dyn EvalBackend>,
    project_id: Option<String>,
    config: SessionConfig,
    keys: MetricKeys,
    lookup: MetricLookup,
    ledger: Arc<RefreshLedger>,
    evaluation_types: Arc<DashMap<String, EvaluationType>>,
    temporal: Arc<TemporalStore>,

    /// Single slot keyed `projectId:runId`.
    scenario_batchers: DashMap<String, Coalescer<ScenarioMetricsLoader>>,
    run_batchers: DashMap<String, Coalescer<RunMetricsLoader>>,
    step_batchers: DashMap<String, Coalescer<StepLoader>>,
    traces: Option<Coalescer<TraceLoader>>,
    annotations: Option<Coalescer<AnnotationLoader>>,
    testcases: Option<Coalescer<TestcaseLoader>>,

    scenario_cache: QueryCache<String, ScenarioEntry>,
    run_stats_cache: QueryCache<String, Arc<RunLevelStatsMap>>,
    annotation_cache: QueryCache<String, Option<Vec<Annotation>>>,
}

impl EvalSession {
    pub fn new(backend: Arc<dyn EvalBackend>, project_id: Option<String>, config: SessionConfig) -> Self {
        Self::with_keys(backend, project_id, config, MetricKeys::default())
    }

    pub fn with_keys(
        backend: Arc<dyn EvalBackend>,
        project_id: Option<String>,
        config: SessionConfig,
        keys: MetricKeys,
    ) -> Self {
        let project_id = project_id.filter(|p| !p.is_empty());
        let window = config.batch_window();
        let ttl = config.query_cache_ttl();

        let traces = project_id
            .as_ref()
            .map(|p| Coalescer::new(TraceLoader::new(backend.clone(), p.clone()), window));
        let annotations = project_id
            .as_ref()
            .map(|p| Coalescer::new(AnnotationLoader::new(backend.clone(), p.clone()), window));
        let testcases = project_id
            .as_ref()
            .map(|p| Coalescer::new(TestcaseLoader::new(backend.clone(), p.clone()), window));

        Self {
            lookup: MetricLookup::new(keys.clone(), config.debug_metric_keys),
            ledger: Arc::new(RefreshLedger::new(config.recent_save_ttl())),
            evaluation_types: Arc::new(DashMap::new()),
            temporal: Arc::new(TemporalStore::new()),
            scenario_batchers: DashMap::new(),
            run_batchers: DashMap::new(),
            step_batchers: DashMap::new(),
            traces,
            annotations,
            testcases,
            scenario_cache: QueryCache::new(ttl),
            run_stats_cache: QueryCache::new(ttl),
            annotation_cache: QueryCache::new(ttl),
            backend,
            project_id,
            config,
            keys,
        }
    }

    /// Session backed by the HTTP client described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, BackendError> {
        let backend = Arc::new(HttpBackend::new(config)?);
        Ok(Self::new(backend, config.project_id.clone(), config.session.clone()))
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn backend(&self) -> &Arc<dyn EvalBackend> {
        &self.backend
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn keys(&self) -> &MetricKeys {
        &self.keys
    }

    pub fn set_evaluation_type(&self, run_id: &str, evaluation_type: EvaluationType) {
        self.evaluation_types.insert(run_id.to_string(), evaluation_type);
    }

    pub fn evaluation_type(&self, run_id: &str) -> EvaluationType {
        self.evaluation_types
            .get(run_id)
            .map(|t| *t)
            .unwrap_or_default()
    }

    // ── Batchers ──────────────────────────────────────────────

    /// The scenario batcher for `run_id`. Asking for a different run
    /// replaces the previous batcher.
    fn scenario_batcher(&self, project_id: &str, run_id: &str) -> Coalescer<ScenarioMetricsLoader> {
        let slot = format!("{}:{}", project_id, run_id);
        if let Some(existing) = self.scenario_batchers.get(&slot) {
            return existing.clone();
        }

        self.scenario_batchers.clear();
        let loader = ScenarioMetricsLoader::new(
            self.backend.clone(),
            self.ledger.clone(),
            self.evaluation_types.clone(),
            self.keys.clone(),
            project_id,
            run_id,
        );
        self.scenario_batchers
            .entry(slot)
            .or_insert_with(|| Coalescer::new(loader, self.config.batch_window()))
            .clone()
    }

    fn run_batcher(&self, project_id: &str) -> Coalescer<RunMetricsLoader> {
        self.run_batchers
            .entry(project_id.to_string())
            .or_insert_with(|| {
                let loader = RunMetricsLoader::new(
                    self.backend.clone(),
                    self.ledger.clone(),
                    self.evaluation_types.clone(),
                    self.temporal.clone(),
                    self.keys.clone(),
                    project_id,
                );
                Coalescer::new(loader, self.config.batch_window())
            })
            .clone()
    }

    fn step_batcher(&self, project_id: &str, run_id: &str) -> Coalescer<StepLoader> {
        self.step_batchers
            .entry(run_id.to_string())
            .or_insert_with(|| {
                Coalescer::new(
                    StepLoader::new(self.backend.clone(), project_id, run_id),
                    self.config.batch_window(),
                )
            })
            .clone()
    }

    // ── Metrics ───────────────────────────────────────────────

    /// Metrics for one scenario. `Ok(None)` means confirmed empty, or no
    /// project selected yet.
    pub async fn scenario_metrics(&self, run_id: &str, scenario_id: &str) -> Result<ScenarioEntry, LoadError> {
        let Some(project_id) = self.project_id.as_deref() else {
            return Ok(None);
        };
        if run_id.is_empty() || scenario_id.is_empty() {
            return Ok(None);
        }

        let batcher = self.scenario_batcher(project_id, run_id);
        let key = scenario_cache_key(run_id, scenario_id);
        self.scenario_cache
            .get_or_try_load(key, || batcher.load(scenario_id.to_string()))
            .await
    }

    /// One metric value out of a scenario, probed by candidate keys.
    pub async fn scenario_metric_value(
        &self,
        run_id: &str,
        scenario_id: &str,
        request: &LookupRequest,
    ) -> Result<Option<LookupHit>, LoadError> {
        let Some(data) = self.scenario_metrics(run_id, scenario_id).await? else {
            return Ok(None);
        };
        let source = LookupSource {
            flat: &data.flat,
            raw: Some(&data.raw),
        };
        Ok(self.lookup.lookup(request, &source))
    }

    pub async fn run_metrics(&self, run_id: &str) -> Result<Option<Arc<RunMetricsSnapshot>>, LoadError> {
        let Some(project_id) = self.project_id.as_deref() else {
            return Ok(None);
        };
        if run_id.is_empty() {
            return Ok(None);
        }
        self.run_batcher(project_id).load(run_id.to_string()).await
    }

    /// Run-level stats, cached per `(run_id, include_temporal)`.
    pub async fn run_level_stats(
        &self,
        run_id: &str,
        include_temporal: bool,
    ) -> Result<Option<Arc<RunLevelStatsMap>>, LoadError> {
        if self.project_id.is_none() || run_id.is_empty() {
            return Ok(None);
        }
        let key = run_stats_cache_key(run_id, include_temporal);
        let stats = self
            .run_stats_cache
            .get_or_try_load(key, || async {
                let snapshot = self.run_metrics(run_id).await?.unwrap_or_default();
                Ok::<_, LoadError>(Arc::new(snapshot.run_level_stats(include_temporal, &self.keys)))
            })
            .await?;
        Ok(Some(stats))
    }

    /// One metric value out of the run-level stats.
    pub async fn run_metric_value(
        &self,
        run_id: &str,
        include_temporal: bool,
        request: &LookupRequest,
    ) -> Result<Option<LookupHit>, LoadError> {
        let Some(stats) = self.run_level_stats(run_id, include_temporal).await? else {
            return Ok(None);
        };
        let source = LookupSource {
            flat: &stats,
            raw: None,
        };
        Ok(self.lookup.lookup(request, &source))
    }

    pub fn temporal_series(&self, run_id: &str, series_key: &str) -> Option<Vec<TemporalMetricPoint>> {
        self.temporal.series(run_id, series_key)
    }

    /// Stats of a temporal series as they were at `at_ms`.
    pub fn stats_at(&self, run_id: &str, series_key: &str, at_ms: i64) -> Option<StatSummary> {
        self.temporal.stats_at(run_id, series_key, at_ms)
    }

    // ── Traces, annotations, steps ────────────────────────────

    pub async fn trace(&self, trace_id: &str) -> Result<Option<TraceTree>, LoadError> {
        match &self.traces {
            Some(traces) if !trace_id.is_empty() => traces.load(trace_id.to_string()).await,
            _ => Ok(None),
        }
    }

    pub async fn annotations(&self, link: AnnotationLink) -> Result<Option<Vec<Annotation>>, LoadError> {
        let Some(loader) = self.annotations.as_ref() else {
            return Ok(None);
        };
        if link.trace_id.is_empty() {
            return Ok(None);
        }
        let key = canonical_trace_id(&link.trace_id);
        self.annotation_cache
            .get_or_try_load(key, || loader.load(link))
            .await
    }

    pub async fn scenario_steps(&self, run_id: &str, scenario_id: &str) -> Result<Option<Vec<StepResult>>, LoadError> {
        let Some(project_id) = self.project_id.as_deref() else {
            return Ok(None);
        };
        if run_id.is_empty() || scenario_id.is_empty() {
            return Ok(None);
        }
        self.step_batcher(project_id, run_id)
            .load(scenario_id.to_string())
            .await
    }

    pub async fn testcase(&self, testcase_id: &str) -> Result<Option<Testcase>, LoadError> {
        match &self.testcases {
            Some(testcases) if !testcase_id.is_empty() => testcases.load(testcase_id.to_string()).await,
            _ => Ok(None),
        }
    }

    // ── Invalidation hooks ────────────────────────────────────

    pub fn invalidate_scenario(&self, run_id: &str, scenario_id: &str) {
        self.scenario_cache
            .invalidate(&scenario_cache_key(run_id, scenario_id));
        self.invalidate_run_stats(run_id);
    }

    pub fn invalidate_run(&self, run_id: &str) {
        self.scenario_cache.invalidate_prefix(&format!("{}:", run_id));
        self.invalidate_run_stats(run_id);
        self.temporal.clear_run(run_id);
        self.step_batchers.remove(run_id);
    }

    fn invalidate_run_stats(&self, run_id: &str) {
        self.run_stats_cache.invalidate(&run_stats_cache_key(run_id, false));
        self.run_stats_cache.invalidate(&run_stats_cache_key(run_id, true));
    }

    pub fn invalidate_annotations(&self, trace_id: &str) {
        self.annotation_cache
            .invalidate(&canonical_trace_id(trace_id));
    }

    pub fn clear_bootstrap(&self, run_id: &str) {
        self.ledger.clear_bootstrap(run_id);
    }

    pub fn mark_scenario_saved(&self, scenario_id: &str) {
        self.ledger.mark_saved(scenario_id);
    }

    pub fn invalidate_all(&self) {
        self.scenario_cache.invalidate_all();
        self.run_stats_cache.invalidate_all();
        self.annotation_cache.invalidate_all();
        self.scenario_batchers.clear();
        self.step_batchers.clear();
        self.temporal.clear();
        self.ledger.clear();
    }

    /// Drop expired cache entries and save stamps.
    pub fn evict_expired(&self) -> usize {
        self.ledger.evict_expired();
        self.scenario_cache.evict_expired()
            + self.run_stats_cache.evict_expired()
            + self.annotation_cache.evict_expired()
    }

    pub fn subscribe_scenarios(&self) -> tokio::sync::broadcast::Receiver<Invalidation> {
        self.scenario_cache.subscribe()
    }

    pub fn subscribe_annotations(&self) -> tokio::sync::broadcast::Receiver<Invalidation> {
        self.annotation_cache.subscribe()
    }
}

fn scenario_cache_key(run_id: &str, scenario_id: &str) -> String {
    format!("{}:{}", run_id, scenario_id)
}

fn run_stats_cache_key(run_id: &str, include_temporal: bool) -> String {
    format!("{}:{}", run_id, if include_temporal { "temporal" } else { "static" })
}
