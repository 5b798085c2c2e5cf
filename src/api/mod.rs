//! Backend seam. Everything the core needs from the evaluation service
//! goes through [`EvalBackend`], so tests can swap in an in-memory fake.

use async_trait::async_trait;

use crate::errors::BackendError;
use crate::models::annotation::{Annotation, AnnotationLink, AnnotationWriteRequest};
use crate::models::metric::{MetricQueryFilter, MetricRecord, RefreshTarget};
use crate::models::step::{ScenarioInfo, StepResult, Testcase};
use crate::models::trace::TraceQueryResponse;

pub mod client;

pub use client::HttpBackend;

#[async_trait]
pub trait EvalBackend: Send + Sync {
    async fn query_metrics(
        &self,
        project_id: &str,
        filter: MetricQueryFilter,
    ) -> Result<Vec<MetricRecord>, BackendError>;

    /// Ask the backend to recompute aggregates; returns the records it wrote.
    async fn refresh_metrics(
        &self,
        project_id: &str,
        target: &RefreshTarget,
    ) -> Result<Vec<MetricRecord>, BackendError>;

    async fn delete_metrics(&self, project_id: &str, metric_ids: &[String]) -> Result<(), BackendError>;

    async fn query_scenarios(
        &self,
        project_id: &str,
        run_id: &str,
        scenario_ids: &[String],
    ) -> Result<Vec<ScenarioInfo>, BackendError>;

    async fn query_results(
        &self,
        project_id: &str,
        run_id: &str,
        scenario_ids: &[String],
    ) -> Result<Vec<StepResult>, BackendError>;

    async fn query_traces(
        &self,
        project_id: &str,
        trace_ids: &[String],
    ) -> Result<TraceQueryResponse, BackendError>;

    async fn query_annotations(
        &self,
        project_id: &str,
        links: &[AnnotationLink],
    ) -> Result<Vec<Annotation>, BackendError>;

    async fn query_testcases(
        &self,
        project_id: &str,
        testcase_ids: &[String],
    ) -> Result<Vec<Testcase>, BackendError>;

    async fn create_annotation(
        &self,
        project_id: &str,
        request: &AnnotationWriteRequest,
    ) -> Result<Option<Annotation>, BackendError>;

    async fn update_annotation(
        &self,
        project_id: &str,
        trace_id: &str,
        span_id: &str,
        request: &AnnotationWriteRequest,
    ) -> Result<Option<Annotation>, BackendError>;
}
