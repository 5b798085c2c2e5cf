/// HTTP implementation of the evaluation backend.
/// Uses reqwest-middleware for transient-failure retries.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::EvalBackend;
use crate::config::Config;
use crate::errors::BackendError;
use crate::models::annotation::{
    Annotation, AnnotationLink, AnnotationQueryRequest, AnnotationResponse, AnnotationWriteRequest,
    AnnotationsResponse,
};
use crate::models::metric::{
    MetricDeleteRequest, MetricQueryFilter, MetricQueryRequest, MetricRecord, MetricRefreshRequest,
    MetricsResponse, RefreshTarget,
};
use crate::models::step::{
    ResultQueryFilter, ResultQueryRequest, ResultsResponse, ScenarioInfo, ScenarioQueryFilter,
    ScenarioQueryRequest, ScenariosResponse, StepResult, Testcase, TestcaseQueryRequest,
    TestcasesResponse,
};
use crate::models::trace::{TraceQueryRequest, TraceQueryResponse};

const METRICS_QUERY: &str = "/preview/evaluations/metrics/query";
const METRICS_REFRESH: &str = "/preview/evaluations/metrics/refresh";
const METRICS_DELETE: &str = "/preview/evaluations/metrics/";
const SCENARIOS_QUERY: &str = "/preview/evaluations/scenarios/query";
const RESULTS_QUERY: &str = "/preview/evaluations/results/query";
const SPANS_QUERY: &str = "/preview/tracing/spans/query";
const ANNOTATIONS_QUERY: &str = "/preview/annotations/query";
const ANNOTATIONS: &str = "/preview/annotations/";
const TESTCASES_QUERY: &str = "/preview/testcases/query";

pub struct HttpBackend {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &Config) -> Result<Self, BackendError> {
        Self::with_options(
            &config.api_url,
            config.api_key.clone(),
            Duration::from_secs(config.http_timeout_secs),
            config.http_max_retries,
        )
    }

    pub fn with_options(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, BackendError> {
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(16)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {}", e)))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn call<B, R>(&self, method: Method, path: &str, project_id: &str, body: &B) -> Result<R, BackendError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned + Default,
    {
        let text = self.execute(method, path, project_id, body).await?;
        if text.trim().is_empty() {
            return Ok(R::default());
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn execute<B>(&self, method: Method, path: &str, project_id: &str, body: &B) -> Result<String, BackendError>
    where
        B: Serialize + ?Sized + Sync,
    {
        if project_id.is_empty() {
            return Err(BackendError::MissingProject);
        }

        let url = format!("{}{}", self.base_url, path);
        let request_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(body)?;

        let mut req = self
            .client
            .request(method.clone(), &url)
            .query(&[("project_id", project_id)])
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("x-request-id", request_id.as_str())
            .body(payload);

        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("ApiKey {}", key));
        }

        tracing::debug!(%method, path, project_id, request_id = %request_id, "backend request");

        let resp = req.send().await.map_err(|e| {
            tracing::warn!(%method, path, request_id = %request_id, error = %e, "backend request failed after retries");
            BackendError::Transport(e.to_string())
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BackendError::Transport(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            tracing::warn!(
                %method,
                path,
                request_id = %request_id,
                status = status.as_u16(),
                "backend returned error status"
            );
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(text)
    }
}

#[async_trait]
impl EvalBackend for HttpBackend {
    async fn query_metrics(
        &self,
        project_id: &str,
        filter: MetricQueryFilter,
    ) -> Result<Vec<MetricRecord>, BackendError> {
        let body = MetricQueryRequest { metric: filter };
        let resp: MetricsResponse = self.call(Method::POST, METRICS_QUERY, project_id, &body).await?;
        Ok(resp.metrics)
    }

    async fn refresh_metrics(
        &self,
        project_id: &str,
        target: &RefreshTarget,
    ) -> Result<Vec<MetricRecord>, BackendError> {
        let body = MetricRefreshRequest::from(target);
        let resp: MetricsResponse = self.call(Method::POST, METRICS_REFRESH, project_id, &body).await?;
        Ok(resp.metrics)
    }

    async fn delete_metrics(&self, project_id: &str, metric_ids: &[String]) -> Result<(), BackendError> {
        let body = MetricDeleteRequest {
            metrics_ids: metric_ids.to_vec(),
        };
        self.execute(Method::DELETE, METRICS_DELETE, project_id, &body).await?;
        Ok(())
    }

    async fn query_scenarios(
        &self,
        project_id: &str,
        run_id: &str,
        scenario_ids: &[String],
    ) -> Result<Vec<ScenarioInfo>, BackendError> {
        let body = ScenarioQueryRequest {
            scenario: ScenarioQueryFilter {
                ids: scenario_ids.to_vec(),
                run_ids: vec![run_id.to_string()],
            },
        };
        let resp: ScenariosResponse = self.call(Method::POST, SCENARIOS_QUERY, project_id, &body).await?;
        Ok(resp.scenarios)
    }

    async fn query_results(
        &self,
        project_id: &str,
        run_id: &str,
        scenario_ids: &[String],
    ) -> Result<Vec<StepResult>, BackendError> {
        let body = ResultQueryRequest {
            result: ResultQueryFilter {
                run_id: run_id.to_string(),
                scenario_ids: scenario_ids.to_vec(),
            },
        };
        let resp: ResultsResponse = self.call(Method::POST, RESULTS_QUERY, project_id, &body).await?;
        Ok(resp.results)
    }

    async fn query_traces(
        &self,
        project_id: &str,
        trace_ids: &[String],
    ) -> Result<TraceQueryResponse, BackendError> {
        let body = TraceQueryRequest::for_trace_ids(trace_ids.to_vec());
        self.call(Method::POST, SPANS_QUERY, project_id, &body).await
    }

    async fn query_annotations(
        &self,
        project_id: &str,
        links: &[AnnotationLink],
    ) -> Result<Vec<Annotation>, BackendError> {
        let body = AnnotationQueryRequest {
            annotation_links: links.to_vec(),
        };
        let resp: AnnotationsResponse = self.call(Method::POST, ANNOTATIONS_QUERY, project_id, &body).await?;
        Ok(resp.annotations)
    }

    async fn query_testcases(
        &self,
        project_id: &str,
        testcase_ids: &[String],
    ) -> Result<Vec<Testcase>, BackendError> {
        let body = TestcaseQueryRequest {
            testcase_ids: testcase_ids.to_vec(),
        };
        let resp: TestcasesResponse = self.call(Method::POST, TESTCASES_QUERY, project_id, &body).await?;
        Ok(resp.testcases)
    }

    async fn create_annotation(
        &self,
        project_id: &str,
        request: &AnnotationWriteRequest,
    ) -> Result<Option<Annotation>, BackendError> {
        let resp: AnnotationResponse = self.call(Method::POST, ANNOTATIONS, project_id, request).await?;
        Ok(resp.annotation)
    }

    async fn update_annotation(
        &self,
        project_id: &str,
        trace_id: &str,
        span_id: &str,
        request: &AnnotationWriteRequest,
    ) -> Result<Option<Annotation>, BackendError> {
        let path = format!("{}{}/{}", ANNOTATIONS, trace_id, span_id);
        let resp: AnnotationResponse = self.call(Method::PATCH, &path, project_id, request).await?;
        Ok(resp.annotation)
    }
}
