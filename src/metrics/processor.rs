//! Read-repair bookkeeping for one metric fetch.
//!
//! A [`MetricProcessor`] classifies each fetched record, collects what
//! looks stale or missing, and [`MetricProcessor::flush`] performs the
//! refresh round trip. Every network failure inside `flush` is logged and
//! treated as "the backend returned nothing"; it never reaches the caller.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};

use crate::api::EvalBackend;
use crate::models::metric::{EvaluationType, MetricRecord, MetricScope, RefreshTarget};
use crate::models::stats::contains_legacy_leaf;
use crate::models::step::is_terminal_status;

pub const REASON_LEGACY_VALUE_LEAF: &str = "legacy-value-leaf";
pub const REASON_LEGACY_RUN_VALUE_LEAF: &str = "legacy-run-value-leaf";
pub const REASON_MISSING_RUN_LEVEL_ENTRY: &str = "missing-run-level-entry";
pub const REASON_MISSING_SCENARIO_METRIC: &str = "missing-scenario-metric";

/// Statuses of scenarios that have not produced output yet.
const PENDING_EXECUTION: &[&str] = &[
    "pending",
    "waiting",
    "created",
    "queued",
    "scheduled",
    "initializing",
    "not_started",
];

/// True when a scenario has not executed yet and its metrics cannot be
/// stale. For human evaluations `pending` means only the annotation is
/// outstanding, and a missing status means the invocation already ran.
pub fn is_pending_execution(status: Option<&str>, evaluation_type: EvaluationType) -> bool {
    match status {
        None => !evaluation_type.is_human(),
        Some("pending") if evaluation_type.is_human() => false,
        Some(s) => PENDING_EXECUTION.contains(&s),
    }
}

/// Refresh bookkeeping that outlives a single processor: which runs have
/// already had a bootstrap refresh and which scenarios were just written.
#[derive(Debug)]
pub struct RefreshLedger {
    bootstrap_attempted: DashSet<String>,
    recent_saves: DashMap<String, Instant>,
    recent_save_ttl: Duration,
}

impl RefreshLedger {
    pub fn new(recent_save_ttl: Duration) -> Self {
        Self {
            bootstrap_attempted: DashSet::new(),
            recent_saves: DashMap::new(),
            recent_save_ttl,
        }
    }

    pub fn bootstrap_attempted(&self, run_id: &str) -> bool {
        self.bootstrap_attempted.contains(run_id)
    }

    /// Returns false if the run was already marked.
    pub fn mark_bootstrap_attempted(&self, run_id: &str) -> bool {
        self.bootstrap_attempted.insert(run_id.to_string())
    }

    pub fn clear_bootstrap(&self, run_id: &str) {
        self.bootstrap_attempted.remove(run_id);
    }

    pub fn mark_saved(&self, scenario_id: &str) {
        self.recent_saves.insert(scenario_id.to_string(), Instant::now());
    }

    pub fn was_recently_saved(&self, scenario_id: &str) -> bool {
        let fresh = match self.recent_saves.get(scenario_id) {
            Some(saved_at) => saved_at.elapsed() < self.recent_save_ttl,
            None => return false,
        };
        if !fresh {
            self.recent_saves.remove(scenario_id);
        }
        fresh
    }

    /// Drop expired save stamps.
    pub fn evict_expired(&self) {
        let ttl = self.recent_save_ttl;
        self.recent_saves.retain(|_, saved_at| saved_at.elapsed() < ttl);
    }

    pub fn clear(&self) {
        self.bootstrap_attempted.clear();
        self.recent_saves.clear();
    }
}

/// Classification of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    pub scope: MetricScope,
    pub scenario_id: Option<String>,
    pub metric_id: Option<String>,
    pub status: Option<String>,
    pub reasons: Vec<String>,
    pub should_refresh: bool,
    pub should_delete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioGap {
    pub scenario_id: String,
    pub reason: String,
    pub status: Option<String>,
    /// Whether the gap added the scenario to the refresh set.
    pub actionable: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    pub trigger_refresh: bool,
    pub is_temporal_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushResult {
    /// At least one refresh call returned a metric.
    pub refreshed: bool,
    /// Old ids that no refresh reused; the caller deletes these.
    pub stale_metric_ids: Vec<String>,
    pub reused_metric_ids: Vec<String>,
    /// Scenarios for which a refresh returned data.
    pub refreshed_scenarios: Vec<String>,
    pub run_refresh_attempted: bool,
    pub run_refreshed: bool,
}

pub struct MetricProcessor {
    backend: Arc<dyn EvalBackend>,
    ledger: Arc<RefreshLedger>,
    project_id: String,
    run_id: String,
    evaluation_type: EvaluationType,

    pending: Vec<ProcessResult>,
    scenario_ids: BTreeSet<String>,
    metric_ids: BTreeSet<String>,
    run_level_flags: Vec<String>,
    scenario_gaps: Vec<ScenarioGap>,
    old_scenario_ids: HashMap<String, BTreeSet<String>>,
    old_run_ids: BTreeSet<String>,
}

impl MetricProcessor {
    pub fn new(
        backend: Arc<dyn EvalBackend>,
        ledger: Arc<RefreshLedger>,
        project_id: impl Into<String>,
        run_id: impl Into<String>,
        evaluation_type: EvaluationType,
    ) -> Self {
        Self {
            backend,
            ledger,
            project_id: project_id.into(),
            run_id: run_id.into(),
            evaluation_type,
            pending: Vec::new(),
            scenario_ids: BTreeSet::new(),
            metric_ids: BTreeSet::new(),
            run_level_flags: Vec::new(),
            scenario_gaps: Vec::new(),
            old_scenario_ids: HashMap::new(),
            old_run_ids: BTreeSet::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pending(&self) -> &[ProcessResult] {
        &self.pending
    }

    /// Scenarios currently flagged for refresh.
    pub fn scenario_ids(&self) -> &BTreeSet<String> {
        &self.scenario_ids
    }

    /// Metric ids slated for deletion once superseded.
    pub fn metric_ids(&self) -> &BTreeSet<String> {
        &self.metric_ids
    }

    pub fn run_level_flags(&self) -> &[String] {
        &self.run_level_flags
    }

    pub fn scenario_gaps(&self) -> &[ScenarioGap] {
        &self.scenario_gaps
    }

    pub fn process_metric(&mut self, record: &MetricRecord, scope: MetricScope) -> ProcessResult {
        let status = record.normalized_status();
        let mut result = ProcessResult {
            scope,
            scenario_id: record.scenario_id.clone(),
            metric_id: record.id.clone(),
            status: status.clone(),
            reasons: Vec::new(),
            should_refresh: false,
            should_delete: false,
        };

        match scope {
            MetricScope::Scenario => {
                if is_pending_execution(status.as_deref(), self.evaluation_type) {
                    return result;
                }
                if let Some(ref s) = status {
                    if s != "success" {
                        result.reasons.push(format!("status:{}", s));
                    }
                }
                if contains_legacy_leaf(&record.data) {
                    result.reasons.push(REASON_LEGACY_VALUE_LEAF.to_string());
                }
            }
            MetricScope::Run => {
                if contains_legacy_leaf(&record.data) {
                    result.reasons.push(REASON_LEGACY_RUN_VALUE_LEAF.to_string());
                }
            }
        }

        result.should_refresh = !result.reasons.is_empty();
        result.should_delete = result.should_refresh && scope == MetricScope::Scenario && record.id.is_some();

        if result.should_refresh {
            match scope {
                MetricScope::Scenario => {
                    if let Some(ref sid) = record.scenario_id {
                        self.scenario_ids.insert(sid.clone());
                        if let (true, Some(id)) = (result.should_delete, record.id.as_ref()) {
                            self.metric_ids.insert(id.clone());
                            self.old_scenario_ids
                                .entry(sid.clone())
                                .or_default()
                                .insert(id.clone());
                        }
                    }
                }
                MetricScope::Run => {
                    if let Some(ref id) = record.id {
                        self.old_run_ids.insert(id.clone());
                    }
                }
            }
            tracing::debug!(
                run_id = %self.run_id,
                scenario_id = ?record.scenario_id,
                metric_id = ?record.id,
                scope = %scope,
                reasons = ?result.reasons,
                "metric flagged for refresh"
            );
            self.pending.push(result.clone());
        }

        result
    }

    /// Record that no run-level entry covers this run.
    pub fn mark_run_level_gap(&mut self, reason: impl Into<String>) {
        self.run_level_flags.push(reason.into());
    }

    /// Record a scenario without usable metrics. Only a scenario that
    /// finished executing, was not just saved, and is missing metrics
    /// outright is queued for refresh. Returns whether it was queued.
    pub fn mark_scenario_gap(&mut self, scenario_id: &str, reason: &str, scenario_status: Option<&str>) -> bool {
        let actionable = reason == REASON_MISSING_SCENARIO_METRIC
            && is_terminal_status(scenario_status)
            && !self.ledger.was_recently_saved(scenario_id);

        if actionable {
            self.scenario_ids.insert(scenario_id.to_string());
        }

        self.scenario_gaps.push(ScenarioGap {
            scenario_id: scenario_id.to_string(),
            reason: reason.to_string(),
            status: scenario_status.map(str::to_string),
            actionable,
        });
        actionable
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.scenario_ids.is_empty() && self.run_level_flags.is_empty()
    }

    /// Perform the refresh round trip and reset the processor.
    pub async fn flush(&mut self, options: FlushOptions) -> FlushResult {
        if self.is_idle() {
            self.reset();
            return FlushResult::default();
        }

        if !self.scenario_gaps.is_empty() {
            tracing::debug!(
                run_id = %self.run_id,
                gaps = ?self.scenario_gaps,
                "scenario metric gaps"
            );
        }

        let mut result = FlushResult::default();
        let mut stale: BTreeSet<String> = BTreeSet::new();
        let mut reused: BTreeSet<String> = BTreeSet::new();

        if options.trigger_refresh && !self.scenario_ids.is_empty() {
            let returned = self.refresh_scenarios().await;
            for scenario_id in &self.scenario_ids {
                let Some(new_ids) = returned.get(scenario_id) else {
                    continue;
                };
                result.refreshed_scenarios.push(scenario_id.clone());
                if let Some(old) = self.old_scenario_ids.get(scenario_id) {
                    for id in old {
                        if new_ids.contains(id) {
                            reused.insert(id.clone());
                        } else {
                            stale.insert(id.clone());
                        }
                    }
                }
            }
        }

        if options.trigger_refresh && self.should_refresh_run(options) {
            result.run_refresh_attempted = true;
            let new_ids = self.refresh_run().await;
            if !new_ids.is_empty() {
                result.run_refreshed = true;
                for id in &self.old_run_ids {
                    if new_ids.contains(id) {
                        reused.insert(id.clone());
                    } else {
                        stale.insert(id.clone());
                    }
                }
            }
        }

        result.refreshed = !result.refreshed_scenarios.is_empty() || result.run_refreshed;
        result.stale_metric_ids = stale.into_iter().collect();
        result.reused_metric_ids = reused.into_iter().collect();

        if result.refreshed || !result.stale_metric_ids.is_empty() {
            tracing::info!(
                project_id = %self.project_id,
                run_id = %self.run_id,
                refreshed_scenarios = result.refreshed_scenarios.len(),
                run_refreshed = result.run_refreshed,
                stale = result.stale_metric_ids.len(),
                "metric refresh completed"
            );
        }

        self.reset();
        result
    }

    /// Decide whether the run-level entry should be recomputed. A missing
    /// run-level entry on its own is retried once per run, and never for
    /// temporal-only evaluations.
    fn should_refresh_run(&self, options: FlushOptions) -> bool {
        let pending_run = self.pending.iter().any(|p| p.scope == MetricScope::Run);
        if pending_run {
            return true;
        }

        let actionable_flag = self
            .run_level_flags
            .iter()
            .any(|f| f != REASON_MISSING_RUN_LEVEL_ENTRY);
        if actionable_flag {
            return true;
        }

        let only_missing_entry = !self.run_level_flags.is_empty();
        if !only_missing_entry || options.is_temporal_only {
            return false;
        }

        if !self.ledger.mark_bootstrap_attempted(&self.run_id) {
            tracing::debug!(run_id = %self.run_id, "run-level bootstrap already attempted, skipping");
            return false;
        }
        true
    }

    /// Batched scenario refresh plus one individual fallback for every
    /// scenario the batch did not cover. Returns new metric ids per scenario.
    async fn refresh_scenarios(&self) -> HashMap<String, BTreeSet<String>> {
        let scenario_ids: Vec<String> = self.scenario_ids.iter().cloned().collect();
        let target = RefreshTarget::Scenarios {
            run_id: self.run_id.clone(),
            scenario_ids: scenario_ids.clone(),
        };

        let mut returned: HashMap<String, BTreeSet<String>> = HashMap::new();
        match self.backend.refresh_metrics(&self.project_id, &target).await {
            Ok(metrics) => collect_ids(&mut returned, metrics),
            Err(e) => tracing::warn!(
                project_id = %self.project_id,
                run_id = %self.run_id,
                scenario_ids = ?scenario_ids,
                error = %e,
                "batched scenario metric refresh failed"
            ),
        }

        let missing: Vec<&String> = scenario_ids
            .iter()
            .filter(|sid| !returned.contains_key(sid.as_str()))
            .collect();

        let fallbacks = missing.iter().map(|sid| {
            let target = RefreshTarget::Scenario {
                run_id: self.run_id.clone(),
                scenario_id: (*sid).clone(),
            };
            async move {
                let outcome = self.backend.refresh_metrics(&self.project_id, &target).await;
                (sid, outcome)
            }
        });

        for (sid, outcome) in futures::future::join_all(fallbacks).await {
            match outcome {
                Ok(metrics) => collect_ids(&mut returned, metrics),
                Err(e) => tracing::warn!(
                    project_id = %self.project_id,
                    run_id = %self.run_id,
                    scenario_id = %sid,
                    error = %e,
                    "scenario metric refresh failed"
                ),
            }
        }

        returned
    }

    async fn refresh_run(&self) -> BTreeSet<String> {
        let target = RefreshTarget::Run {
            run_id: self.run_id.clone(),
        };
        match self.backend.refresh_metrics(&self.project_id, &target).await {
            Ok(metrics) => metrics
                .into_iter()
                .filter(MetricRecord::is_run_level)
                .filter_map(|m| m.id)
                .collect(),
            Err(e) => {
                tracing::warn!(
                    project_id = %self.project_id,
                    run_id = %self.run_id,
                    error = %e,
                    "run metric refresh failed"
                );
                BTreeSet::new()
            }
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.scenario_ids.clear();
        self.metric_ids.clear();
        self.run_level_flags.clear();
        self.scenario_gaps.clear();
        self.old_scenario_ids.clear();
        self.old_run_ids.clear();
    }
}

/// Group returned scenario metrics by scenario. A record without an id
/// still marks its scenario as returned, with no id added.
fn collect_ids(into: &mut HashMap<String, BTreeSet<String>>, metrics: Vec<MetricRecord>) {
    for m in metrics {
        let Some(sid) = m.scenario_id else { continue };
        let ids = into.entry(sid).or_default();
        if let Some(id) = m.id {
            ids.insert(id);
        }
    }
}
