//! Column value resolution for the scenario table.
//!
//! A column names a logical value (an input, an invocation output, a metric
//! or an annotation field). Resolution tries, in order: the step's own
//! failure, the entity the step references, then a dotted-path walk over
//! the raw step and trace payloads.

use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use crate::errors::LoadError;
use crate::metrics::lookup::{walk_dotted, LookupRequest};
use crate::models::annotation::{Annotation, AnnotationLink};
use crate::models::step::{StepError, StepResult};
use crate::models::trace::TraceTree;
use crate::store::EvalSession;

/// Leading segments that name a payload section rather than a field.
const SECTION_SEGMENTS: &[&str] = &["inputs", "outputs", "data"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Input,
    Invocation,
    Metric,
    Annotation,
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" | "inputs" => Ok(StepType::Input),
            "invocation" => Ok(StepType::Invocation),
            "metric" | "metrics" => Ok(StepType::Metric),
            "annotation" => Ok(StepType::Annotation),
            other => Err(format!("unknown step type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub step_type: StepType,
    pub path: Option<String>,
    pub step_key: Option<String>,
    pub metric_key: Option<String>,
    pub evaluator_key: Option<String>,
    pub value_key: Option<String>,
}

impl ColumnDescriptor {
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            path: None,
            step_key: None,
            metric_key: None,
            evaluator_key: None,
            value_key: None,
        }
    }

    /// Field path inside the referenced entity.
    fn field_path(&self) -> Option<&str> {
        self.path
            .as_deref()
            .or(self.metric_key.as_deref())
            .filter(|p| !p.is_empty())
    }

    fn lookup_request(&self) -> LookupRequest {
        LookupRequest {
            path: self.path.clone(),
            metric_key: self.metric_key.clone(),
            step_key: self.step_key.clone(),
            evaluator_key: self.evaluator_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Testcase,
    Trace,
    Metric,
    Annotation,
    StepPath,
    TracePath,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnValue {
    Error(StepError),
    Value { source: ValueSource, value: Value },
    Missing,
}

impl ColumnValue {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ColumnValue::Value { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// `{type: "string", count: N}`: a free-text metric that was counted but
/// cannot carry a value.
pub fn is_string_placeholder(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("type").and_then(Value::as_str) == Some("string")
        && map.keys().all(|k| k == "type" || k == "count")
}

fn segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Walk `path` under `node`, retrying without a leading section segment.
fn probe<'a>(node: &'a Value, path: Option<&str>) -> Option<&'a Value> {
    let Some(path) = path else {
        return match node {
            Value::Null => None,
            other => Some(other),
        };
    };
    let segs = segments(path);
    if let Some(found) = walk_dotted(node, &segs) {
        return Some(found);
    }
    match segs.split_first() {
        Some((head, rest)) if SECTION_SEGMENTS.contains(head) && !rest.is_empty() => walk_dotted(node, rest),
        _ => None,
    }
}

fn select_value_key(value: Value, value_key: Option<&str>) -> Value {
    match (value_key, &value) {
        (Some(key), Value::Object(map)) => map.get(key).cloned().unwrap_or(value),
        _ => value,
    }
}

/// The step a column reads from: the one matching `step_key`, else the
/// first step carrying the reference this column type needs.
fn select_step<'a>(steps: &'a [StepResult], column: &ColumnDescriptor) -> Option<&'a StepResult> {
    if let Some(key) = column.step_key.as_deref() {
        if let Some(step) = steps.iter().find(|s| s.step_key == key) {
            return Some(step);
        }
    }
    steps.iter().find(|s| match column.step_type {
        StepType::Input => s.testcase_id.is_some(),
        StepType::Invocation | StepType::Annotation | StepType::Metric => s.trace_id.is_some(),
    })
}

/// Pick the annotation written by the column's evaluator.
fn annotation_value(annotations: &[Annotation], column: &ColumnDescriptor) -> Option<Value> {
    let evaluator = column.evaluator_key.as_deref();
    let field = column.metric_key.as_deref().or(column.path.as_deref());

    annotations
        .iter()
        .filter(|a| evaluator.is_none() || a.evaluator_slug() == evaluator)
        .find_map(|a| {
            let outputs = Value::Object(a.data.outputs.clone());
            probe(&outputs, field).cloned()
        })
}

pub struct ColumnResolver<'a> {
    session: &'a EvalSession,
}

impl<'a> ColumnResolver<'a> {
    pub fn new(session: &'a EvalSession) -> Self {
        Self { session }
    }

    pub async fn resolve(
        &self,
        run_id: &str,
        scenario_id: &str,
        column: &ColumnDescriptor,
    ) -> Result<ColumnValue, LoadError> {
        let steps = self
            .session
            .scenario_steps(run_id, scenario_id)
            .await?
            .unwrap_or_default();
        let step = select_step(&steps, column);

        if let Some(failure) = step.and_then(StepResult::failure) {
            tracing::debug!(run_id, scenario_id, step_key = %failure.step_key, "column resolved to step error");
            return Ok(ColumnValue::Error(failure));
        }

        let mut trace: Option<TraceTree> = None;
        if let Some(trace_id) = step.and_then(|s| s.trace_id.as_deref()) {
            if matches!(column.step_type, StepType::Invocation) {
                trace = self.session.trace(trace_id).await?;
            }
        }

        if let Some((source, value)) = self.direct(run_id, scenario_id, step, trace.as_ref(), column).await? {
            return Ok(ColumnValue::Value {
                source,
                value: select_value_key(value, column.value_key.as_deref()),
            });
        }

        Ok(self
            .path_fallback(step, trace.as_ref(), column)
            .map(|(source, value)| ColumnValue::Value {
                source,
                value: select_value_key(value, column.value_key.as_deref()),
            })
            .unwrap_or(ColumnValue::Missing))
    }

    async fn direct(
        &self,
        run_id: &str,
        scenario_id: &str,
        step: Option<&StepResult>,
        trace: Option<&TraceTree>,
        column: &ColumnDescriptor,
    ) -> Result<Option<(ValueSource, Value)>, LoadError> {
        match column.step_type {
            StepType::Input => {
                let Some(testcase_id) = step.and_then(|s| s.testcase_id.as_deref()) else {
                    return Ok(None);
                };
                let testcase = self.session.testcase(testcase_id).await?;
                Ok(testcase
                    .and_then(|tc| probe(&tc.data, column.field_path()).cloned())
                    .map(|v| (ValueSource::Testcase, v)))
            }
            StepType::Invocation => Ok(trace
                .and_then(TraceTree::root_outputs)
                .and_then(|outputs| probe(outputs, column.path.as_deref()).cloned())
                .map(|v| (ValueSource::Trace, v))),
            StepType::Metric => {
                let hit = self
                    .session
                    .scenario_metric_value(run_id, scenario_id, &column.lookup_request())
                    .await?;
                match hit {
                    Some(hit) if !is_string_placeholder(&hit.value) => Ok(Some((ValueSource::Metric, hit.value))),
                    Some(_) => {
                        tracing::debug!(run_id, scenario_id, "string metric placeholder, reading annotation");
                        self.from_annotations(step, column).await
                    }
                    None => Ok(None),
                }
            }
            StepType::Annotation => self.from_annotations(step, column).await,
        }
    }

    async fn from_annotations(
        &self,
        step: Option<&StepResult>,
        column: &ColumnDescriptor,
    ) -> Result<Option<(ValueSource, Value)>, LoadError> {
        let Some(step) = step else {
            return Ok(None);
        };
        let Some(trace_id) = step.trace_id.as_deref() else {
            return Ok(None);
        };
        let link = AnnotationLink {
            trace_id: trace_id.to_string(),
            span_id: step.span_id.clone(),
        };
        let annotations = self.session.annotations(link).await?.unwrap_or_default();
        Ok(annotation_value(&annotations, column).map(|v| (ValueSource::Annotation, v)))
    }

    fn path_fallback(
        &self,
        step: Option<&StepResult>,
        trace: Option<&TraceTree>,
        column: &ColumnDescriptor,
    ) -> Option<(ValueSource, Value)> {
        let path = column.path.as_deref()?;

        if let Some(raw) = step.and_then(|s| serde_json::to_value(s).ok()) {
            if let Some(found) = probe(&raw, Some(path)) {
                return Some((ValueSource::StepPath, found.clone()));
            }
        }
        let root = trace.and_then(TraceTree::root_span)?;
        probe(root, Some(path)).map(|v| (ValueSource::TracePath, v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::models::annotation::{AnnotationData, AnnotationReferences, EntityRef};
    use crate::models::step::Testcase;
    use crate::testing::{record, FakeBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn step(step_key: &str) -> StepResult {
        StepResult {
            run_id: "r1".into(),
            scenario_id: "s1".into(),
            step_key: step_key.into(),
            status: Some("success".into()),
            ..Default::default()
        }
    }

    fn session(backend: &Arc<FakeBackend>) -> EvalSession {
        EvalSession::new(backend.clone(), Some("p1".into()), SessionConfig::default())
    }

    fn annotation(evaluator: &str, outputs: Value) -> Annotation {
        Annotation {
            trace_id: Some("a1".into()),
            data: AnnotationData {
                outputs: outputs.as_object().cloned().unwrap_or_default(),
            },
            references: AnnotationReferences {
                evaluator: Some(EntityRef {
                    id: None,
                    slug: Some(evaluator.into()),
                }),
                testcase: None,
            },
            links: [("invocation".to_string(), AnnotationLink::trace("t1"))].into_iter().collect(),
            ..Default::default()
        }
    }

    // ── Tests ────────────────────────────────────────────────────

    #[test]
    fn test_string_placeholder_detection() {
        assert!(is_string_placeholder(&json!({"type": "string", "count": 3})));
        assert!(!is_string_placeholder(&json!({"type": "string", "count": 3, "frequency": []})));
        assert!(!is_string_placeholder(&json!({"type": "numeric", "count": 3})));
        assert!(!is_string_placeholder(&json!("string")));
    }

    #[test]
    fn test_probe_strips_section_segment() {
        let data = json!({"country": "FR"});
        assert_eq!(probe(&data, Some("inputs.country")), Some(&json!("FR")));
        assert_eq!(probe(&data, Some("country")), Some(&json!("FR")));
        assert!(probe(&data, Some("inputs")).is_none());
    }

    #[tokio::test]
    async fn test_failed_step_wins_over_values() {
        let backend = Arc::new(FakeBackend::default());
        let mut failed = step("input");
        failed.testcase_id = Some("tc1".into());
        failed.status = Some("failed".into());
        failed.error = Some(json!({"message": "boom", "stacktrace": "at x"}));
        backend.results.lock().unwrap().push(failed);
        backend.testcases.lock().unwrap().push(Testcase {
            id: "tc1".into(),
            data: json!({"country": "FR"}),
        });
        let session = session(&backend);

        let mut column = ColumnDescriptor::new(StepType::Input);
        column.path = Some("country".into());
        let value = ColumnResolver::new(&session).resolve("r1", "s1", &column).await.unwrap();

        let ColumnValue::Error(err) = value else {
            panic!("expected step error, got {:?}", value);
        };
        assert_eq!(err.message, "boom");
        assert_eq!(backend.count_calls("query_testcases"), 0);
    }

    #[tokio::test]
    async fn test_input_reads_testcase() {
        let backend = Arc::new(FakeBackend::default());
        let mut input = step("input");
        input.testcase_id = Some("tc1".into());
        backend.results.lock().unwrap().push(input);
        backend.testcases.lock().unwrap().push(Testcase {
            id: "tc1".into(),
            data: json!({"country": "FR"}),
        });
        let session = session(&backend);

        let mut column = ColumnDescriptor::new(StepType::Input);
        column.path = Some("inputs.country".into());
        let value = ColumnResolver::new(&session).resolve("r1", "s1", &column).await.unwrap();
        assert_eq!(
            value,
            ColumnValue::Value {
                source: ValueSource::Testcase,
                value: json!("FR")
            }
        );
    }

    #[tokio::test]
    async fn test_invocation_reads_root_outputs() {
        let backend = Arc::new(FakeBackend::default());
        let mut invocation = step("invocation");
        invocation.trace_id = Some("t1".into());
        backend.results.lock().unwrap().push(invocation);
        backend.traces.lock().unwrap().insert(
            "t1".into(),
            TraceTree {
                spans: json!({"root": {"attributes": {"ag": {"data": {"outputs": {"answer": "Paris"}}}}}}),
            },
        );
        let session = session(&backend);

        let mut column = ColumnDescriptor::new(StepType::Invocation);
        column.path = Some("outputs.answer".into());
        let value = ColumnResolver::new(&session).resolve("r1", "s1", &column).await.unwrap();
        assert_eq!(value.value(), Some(&json!("Paris")));
    }

    #[tokio::test]
    async fn test_metric_value_and_value_key() {
        let backend = Arc::new(FakeBackend::with_metrics(vec![record(
            Some("m1"),
            Some("s1"),
            Some("success"),
            json!({"judge": {"score": {"count": 2, "sum": 1.5, "mean": 0.75}}}),
        )]));
        let session = session(&backend);

        let mut column = ColumnDescriptor::new(StepType::Metric);
        column.step_key = Some("judge".into());
        column.metric_key = Some("score".into());
        column.value_key = Some("mean".into());
        let value = ColumnResolver::new(&session).resolve("r1", "s1", &column).await.unwrap();
        assert_eq!(
            value,
            ColumnValue::Value {
                source: ValueSource::Metric,
                value: json!(0.75)
            }
        );
    }

    #[tokio::test]
    async fn test_string_metric_falls_through_to_annotation() {
        let backend = Arc::new(FakeBackend::with_metrics(vec![record(
            Some("m1"),
            Some("s1"),
            Some("success"),
            json!({"judge": {"comment": {"type": "string", "count": 1}}}),
        )]));
        let mut judge = step("judge");
        judge.trace_id = Some("t1".into());
        backend.results.lock().unwrap().push(judge);
        backend
            .annotations
            .lock()
            .unwrap()
            .push(annotation("judge", json!({"comment": "looks right"})));
        let session = session(&backend);

        let mut column = ColumnDescriptor::new(StepType::Metric);
        column.step_key = Some("judge".into());
        column.metric_key = Some("comment".into());
        column.evaluator_key = Some("judge".into());
        let value = ColumnResolver::new(&session).resolve("r1", "s1", &column).await.unwrap();
        assert_eq!(
            value,
            ColumnValue::Value {
                source: ValueSource::Annotation,
                value: json!("looks right")
            }
        );
    }

    #[tokio::test]
    async fn test_path_fallback_walks_raw_step() {
        let backend = Arc::new(FakeBackend::default());
        let mut judge = step("judge");
        judge.trace_id = Some("t1".into());
        backend.results.lock().unwrap().push(judge);
        let session = session(&backend);

        let mut column = ColumnDescriptor::new(StepType::Annotation);
        column.step_key = Some("judge".into());
        column.path = Some("status".into());
        let value = ColumnResolver::new(&session).resolve("r1", "s1", &column).await.unwrap();
        assert_eq!(
            value,
            ColumnValue::Value {
                source: ValueSource::StepPath,
                value: json!("success")
            }
        );
    }

    #[tokio::test]
    async fn test_nothing_found_is_missing() {
        let backend = Arc::new(FakeBackend::default());
        let session = session(&backend);
        let mut column = ColumnDescriptor::new(StepType::Annotation);
        column.metric_key = Some("comment".into());
        let value = ColumnResolver::new(&session).resolve("r1", "s1", &column).await.unwrap();
        assert_eq!(value, ColumnValue::Missing);
    }

    #[test]
    fn test_step_type_parsing() {
        assert_eq!("Metric".parse::<StepType>(), Ok(StepType::Metric));
        assert_eq!("inputs".parse::<StepType>(), Ok(StepType::Input));
        assert!("bogus".parse::<StepType>().is_err());
    }
}
