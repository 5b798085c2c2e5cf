//! In-memory backend used by unit tests. Records every call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::EvalBackend;
use crate::errors::BackendError;
use crate::models::annotation::{Annotation, AnnotationLink, AnnotationWriteRequest};
use crate::models::metric::{MetricQueryFilter, MetricRecord, RefreshTarget};
use crate::models::step::{ScenarioInfo, StepResult, Testcase};
use crate::models::trace::{TraceQueryResponse, TraceTree};

type RefreshHandler = Box<dyn Fn(&RefreshTarget, &mut Vec<MetricRecord>) -> Vec<MetricRecord> + Send + Sync>;

pub fn record(id: Option<&str>, scenario_id: Option<&str>, status: Option<&str>, data: Value) -> MetricRecord {
    MetricRecord {
        id: id.map(String::from),
        run_id: "r1".into(),
        scenario_id: scenario_id.map(String::from),
        status: status.map(String::from),
        data,
        timestamp: None,
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub metrics: Mutex<Vec<MetricRecord>>,
    pub scenarios: Mutex<Vec<ScenarioInfo>>,
    pub results: Mutex<Vec<StepResult>>,
    pub traces: Mutex<HashMap<String, TraceTree>>,
    pub annotations: Mutex<Vec<Annotation>>,
    pub testcases: Mutex<Vec<Testcase>>,
    pub writes: Mutex<Vec<Value>>,
    calls: Mutex<Vec<String>>,
    refresh_handler: Mutex<Option<RefreshHandler>>,
    fail_refresh: AtomicBool,
    fail_queries: AtomicBool,
    write_error: Mutex<Option<(u16, String)>>,
}

impl FakeBackend {
    pub fn with_metrics(metrics: Vec<MetricRecord>) -> Self {
        let backend = Self::default();
        *backend.metrics.lock().unwrap() = metrics;
        backend
    }

    /// Handler invoked for every refresh; it may rewrite the stored
    /// metrics and returns what the refresh reports.
    pub fn on_refresh<F>(&self, handler: F)
    where
        F: Fn(&RefreshTarget, &mut Vec<MetricRecord>) -> Vec<MetricRecord> + Send + Sync + 'static,
    {
        *self.refresh_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, status: u16, body: &str) {
        *self.write_error.lock().unwrap() = Some((status, body.to_string()));
    }

    pub fn set_scenario_status(&self, scenario_id: &str, status: &str) {
        self.scenarios.lock().unwrap().push(ScenarioInfo {
            id: scenario_id.to_string(),
            run_id: "r1".into(),
            status: Some(status.to_string()),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record_call(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn query_error(&self) -> Result<(), BackendError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn write_result(&self, request: &AnnotationWriteRequest) -> Result<Option<Annotation>, BackendError> {
        if let Some((status, body)) = self.write_error.lock().unwrap().clone() {
            return Err(BackendError::Status { status, body });
        }
        let value = serde_json::to_value(request)?;
        self.writes.lock().unwrap().push(value.clone());
        Ok(serde_json::from_value(value["annotation"].clone()).ok())
    }
}

#[async_trait]
impl EvalBackend for FakeBackend {
    async fn query_metrics(
        &self,
        _project_id: &str,
        filter: MetricQueryFilter,
    ) -> Result<Vec<MetricRecord>, BackendError> {
        self.record_call("query_metrics".into());
        self.query_error()?;
        let metrics = self.metrics.lock().unwrap();
        Ok(metrics
            .iter()
            .filter(|m| filter.run_ids.contains(&m.run_id))
            .filter(|m| match (&filter.scenario_ids, &m.scenario_id) {
                (None, _) => true,
                (Some(ids), Some(sid)) => ids.contains(sid),
                (Some(_), None) => false,
            })
            .cloned()
            .collect())
    }

    async fn refresh_metrics(
        &self,
        _project_id: &str,
        target: &RefreshTarget,
    ) -> Result<Vec<MetricRecord>, BackendError> {
        let call = match target {
            RefreshTarget::Run { .. } => "refresh:run".to_string(),
            RefreshTarget::Scenario { scenario_id, .. } => format!("refresh:scenario:{}", scenario_id),
            RefreshTarget::Scenarios { scenario_ids, .. } => {
                format!("refresh:scenarios:{}", scenario_ids.join(","))
            }
        };
        self.record_call(call);
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let handler = self.refresh_handler.lock().unwrap();
        let mut metrics = self.metrics.lock().unwrap();
        Ok(match handler.as_ref() {
            Some(h) => h(target, &mut metrics),
            None => Vec::new(),
        })
    }

    async fn delete_metrics(&self, _project_id: &str, metric_ids: &[String]) -> Result<(), BackendError> {
        self.record_call(format!("delete:{}", metric_ids.join(",")));
        self.metrics
            .lock()
            .unwrap()
            .retain(|m| m.id.as_ref().map(|id| !metric_ids.contains(id)).unwrap_or(true));
        Ok(())
    }

    async fn query_scenarios(
        &self,
        _project_id: &str,
        _run_id: &str,
        scenario_ids: &[String],
    ) -> Result<Vec<ScenarioInfo>, BackendError> {
        self.record_call("query_scenarios".into());
        self.query_error()?;
        Ok(self
            .scenarios
            .lock()
            .unwrap()
            .iter()
            .filter(|s| scenario_ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn query_results(
        &self,
        _project_id: &str,
        run_id: &str,
        _scenario_ids: &[String],
    ) -> Result<Vec<StepResult>, BackendError> {
        self.record_call("query_results".into());
        self.query_error()?;
        Ok(self
            .results
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn query_traces(
        &self,
        _project_id: &str,
        trace_ids: &[String],
    ) -> Result<TraceQueryResponse, BackendError> {
        self.record_call(format!("query_traces:{}", trace_ids.len()));
        self.query_error()?;
        Ok(TraceQueryResponse {
            traces: self.traces.lock().unwrap().clone(),
            version: None,
        })
    }

    async fn query_annotations(
        &self,
        _project_id: &str,
        links: &[AnnotationLink],
    ) -> Result<Vec<Annotation>, BackendError> {
        self.record_call(format!("query_annotations:{}", links.len()));
        self.query_error()?;
        Ok(self.annotations.lock().unwrap().clone())
    }

    async fn query_testcases(
        &self,
        _project_id: &str,
        testcase_ids: &[String],
    ) -> Result<Vec<Testcase>, BackendError> {
        self.record_call("query_testcases".into());
        self.query_error()?;
        Ok(self
            .testcases
            .lock()
            .unwrap()
            .iter()
            .filter(|tc| testcase_ids.contains(&tc.id))
            .cloned()
            .collect())
    }

    async fn create_annotation(
        &self,
        _project_id: &str,
        request: &AnnotationWriteRequest,
    ) -> Result<Option<Annotation>, BackendError> {
        self.record_call("create_annotation".into());
        self.write_result(request)
    }

    async fn update_annotation(
        &self,
        _project_id: &str,
        trace_id: &str,
        span_id: &str,
        request: &AnnotationWriteRequest,
    ) -> Result<Option<Annotation>, BackendError> {
        self.record_call(format!("update_annotation:{}/{}", trace_id, span_id));
        self.write_result(request)
    }
}
