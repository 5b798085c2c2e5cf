//! End-to-end reconciliation against a mocked evaluation backend.
//!
//! These tests drive `EvalSession` over the real `HttpBackend`. Call counts
//! are enforced with wiremock `.expect(n)` and verified when the server
//! drops at the end of each test.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use evalboard::models::metric::EvaluationType;
use evalboard::{EvalSession, HttpBackend, SessionConfig};

const METRICS_QUERY: &str = "/api/preview/evaluations/metrics/query";
const METRICS_REFRESH: &str = "/api/preview/evaluations/metrics/refresh";
const METRICS_DELETE: &str = "/api/preview/evaluations/metrics/";

fn session(server: &MockServer) -> EvalSession {
    let backend = HttpBackend::with_options(&format!("{}/api", server.uri()), None, Duration::from_secs(5), 0)
        .expect("backend");
    EvalSession::new(Arc::new(backend), Some("p1".into()), SessionConfig::default())
}

fn metrics(records: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "metrics": records }))
}

mod scenario_metrics {
    use super::*;

    #[tokio::test]
    async fn test_fresh_scenario_makes_one_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(METRICS_QUERY))
            .and(query_param("project_id", "p1"))
            .respond_with(metrics(json!([{
                "id": "m1", "run_id": "r1", "scenario_id": "s1", "status": "success",
                "data": {"step1": {"accuracy": {"count": 1, "sum": 1, "mean": 1}}}
            }])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(METRICS_REFRESH))
            .respond_with(metrics(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let data = session(&server)
            .scenario_metrics("r1", "s1")
            .await
            .unwrap()
            .unwrap();
        let accuracy = &data.flat["accuracy"];
        assert_eq!(accuracy.count, Some(1.0));
        assert_eq!(accuracy.sum, Some(1.0));
        assert_eq!(accuracy.mean, Some(1.0));
    }

    #[tokio::test]
    async fn test_legacy_leaf_is_refreshed_deleted_and_refetched() {
        let server = MockServer::start().await;
        // First read sees the legacy leaf, the re-fetch sees the recomputed one.
        Mock::given(method("POST"))
            .and(path(METRICS_QUERY))
            .respond_with(metrics(json!([{
                "id": "m1", "run_id": "r1", "scenario_id": "s1", "status": "success",
                "data": {"step1": {"score": {"value": 0.9}}}
            }])))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(METRICS_QUERY))
            .respond_with(metrics(json!([{
                "id": "m2", "run_id": "r1", "scenario_id": "s1", "status": "success",
                "data": {"step1": {"score": {"count": 1, "sum": 0.9, "mean": 0.9}}}
            }])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(METRICS_REFRESH))
            .and(body_partial_json(json!({"metrics": {"run_id": "r1", "scenario_ids": ["s1"]}})))
            .respond_with(metrics(json!([{
                "id": "m2", "run_id": "r1", "scenario_id": "s1", "status": "success",
                "data": {"step1": {"score": {"count": 1, "sum": 0.9, "mean": 0.9}}}
            }])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(METRICS_DELETE))
            .and(body_partial_json(json!({"metrics_ids": ["m1"]})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let data = session(&server)
            .scenario_metrics("r1", "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.metrics.len(), 1);
        assert_eq!(data.metrics[0].id.as_deref(), Some("m2"));
        assert_eq!(data.flat["score"].mean, Some(0.9));
    }

    #[tokio::test]
    async fn test_concurrent_scenarios_share_one_backend_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(METRICS_QUERY))
            .and(body_partial_json(json!({"metric": {"run_ids": ["r1"]}})))
            .respond_with(metrics(json!([
                {"id": "m1", "run_id": "r1", "scenario_id": "s1", "status": "success",
                 "data": {"judge": {"score": {"count": 1, "sum": 1, "mean": 1}}}},
                {"id": "m2", "run_id": "r1", "scenario_id": "s2", "status": "success",
                 "data": {"judge": {"score": {"count": 1, "sum": 0, "mean": 0}}}},
                {"id": "m3", "run_id": "r1", "scenario_id": "s3", "status": "success",
                 "data": {"judge": {"score": {"count": 1, "sum": 0.5, "mean": 0.5}}}}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let session = session(&server);
        let (a, b, c) = tokio::join!(
            session.scenario_metrics("r1", "s1"),
            session.scenario_metrics("r1", "s2"),
            session.scenario_metrics("r1", "s3"),
        );
        assert_eq!(a.unwrap().unwrap().flat["score"].mean, Some(1.0));
        assert_eq!(b.unwrap().unwrap().flat["score"].mean, Some(0.0));
        assert_eq!(c.unwrap().unwrap().flat["score"].mean, Some(0.5));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_original_and_skips_delete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(METRICS_QUERY))
            .respond_with(metrics(json!([{
                "id": "m1", "run_id": "r1", "scenario_id": "s1", "status": "success",
                "data": {"step1": {"score": {"value": 0.4}}}
            }])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(METRICS_REFRESH))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            // batched call plus the single per-scenario fallback
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(METRICS_DELETE))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let data = session(&server)
            .scenario_metrics("r1", "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.metrics[0].id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_query_failure_reaches_every_waiter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(METRICS_QUERY))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let session = session(&server);
        let (a, b) = tokio::join!(session.scenario_metrics("r1", "s1"), session.scenario_metrics("r1", "s2"));
        assert!(a.is_err());
        assert!(b.is_err());
    }
}

mod run_metrics {
    use super::*;

    #[tokio::test]
    async fn test_missing_run_entry_bootstraps_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(METRICS_QUERY))
            .respond_with(metrics(json!([])))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(METRICS_REFRESH))
            .and(body_partial_json(json!({"metrics": {"run_id": "r1"}})))
            .respond_with(metrics(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let session = session(&server);
        let first = session.run_level_stats("r1", false).await.unwrap().unwrap();
        assert!(first.is_empty());

        session.invalidate_run("r1");
        let second = session.run_level_stats("r1", false).await.unwrap().unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_temporal_only_run_never_bootstraps() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(METRICS_QUERY))
            .respond_with(metrics(json!([
                {"id": "t1", "run_id": "r1", "status": "success", "timestamp": "2024-05-01T10:00:00Z",
                 "data": {"judge": {"score": {"count": 1, "sum": 1, "mean": 1}}}},
                {"id": "t2", "run_id": "r1", "status": "success", "timestamp": "2024-05-01T10:05:00Z",
                 "data": {"judge": {"score": {"count": 1, "sum": 3, "mean": 3}}}}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(METRICS_REFRESH))
            .respond_with(metrics(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let session = session(&server);
        session.set_evaluation_type("r1", EvaluationType::Online);

        let stats = session.run_level_stats("r1", true).await.unwrap().unwrap();
        assert_eq!(stats["score"].count, Some(2.0));
        assert_eq!(stats["score"].sum, Some(4.0));

        let series = session.temporal_series("r1", "judge:score").unwrap();
        assert_eq!(series.len(), 2);
        assert!(series[0].timestamp < series[1].timestamp);
    }
}

mod annotations {
    use super::*;
    use evalboard::annotations::{submit, AnnotationDraft, EvaluatorRef};
    use evalboard::AnnotationError;

    fn draft() -> AnnotationDraft {
        AnnotationDraft {
            run_id: "r1".into(),
            scenario_id: "s1".into(),
            trace_id: "t1".into(),
            outputs: json!({"score": 3}).as_object().cloned().unwrap(),
            ..Default::default()
        }
    }

    fn evaluator() -> EvaluatorRef {
        EvaluatorRef {
            slug: "quality".into(),
            outputs_schema: Some(json!({
                "type": "object",
                "properties": {"score": {"type": "number"}},
                "required": ["score"]
            })),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_creates_annotation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/preview/annotations/"))
            .and(body_partial_json(json!({
                "annotation": {
                    "data": {"outputs": {"score": 3}},
                    "references": {"evaluator": {"slug": "quality"}},
                    "links": {"invocation": {"trace_id": "t1"}}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "annotation": {"trace_id": "a1", "data": {"outputs": {"score": 3}}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let saved = submit(&session(&server), &draft(), &evaluator())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.trace_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_submit_surfaces_backend_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/preview/annotations/"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({"detail": "evaluator is archived"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = submit(&session(&server), &draft(), &evaluator())
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotationError::Submit(ref msg) if msg == "evaluator is archived"));
    }

    #[tokio::test]
    async fn test_invalid_draft_never_reaches_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/preview/annotations/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut bad = draft();
        bad.outputs = json!({"score": "three"}).as_object().cloned().unwrap();
        let err = submit(&session(&server), &bad, &evaluator()).await.unwrap_err();
        assert!(matches!(err, AnnotationError::Validation(_)));
    }
}
