//! Annotation submission: validate against the evaluator schema, write,
//! then invalidate every cache that showed the old value.

use std::collections::HashMap;

use jsonschema::JSONSchema;
use serde_json::{Map, Value};

use crate::errors::AnnotationError;
use crate::models::annotation::{
    Annotation, AnnotationData, AnnotationLink, AnnotationReferences, AnnotationWrite, AnnotationWriteRequest,
    EntityRef,
};
use crate::store::EvalSession;

const GENERIC_FAILURE: &str = "failed to save annotation";

/// Evaluator the annotation is written for.
#[derive(Debug, Clone, Default)]
pub struct EvaluatorRef {
    pub id: Option<String>,
    pub slug: String,
    /// JSON schema the `outputs` object must satisfy.
    pub outputs_schema: Option<Value>,
}

/// An annotation as edited by the user.
#[derive(Debug, Clone, Default)]
pub struct AnnotationDraft {
    pub run_id: String,
    pub scenario_id: String,
    /// Invocation trace being annotated.
    pub trace_id: String,
    pub span_id: Option<String>,
    pub testcase_id: Option<String>,
    pub outputs: Map<String, Value>,
    /// `(trace_id, span_id)` of the annotation being edited, if any.
    pub existing: Option<(String, String)>,
}

/// Validate `outputs` against `schema`. Returns one message per violation.
pub fn validate_outputs(schema: &Value, outputs: &Map<String, Value>) -> Result<(), AnnotationError> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| AnnotationError::Validation(vec![format!("evaluator schema is invalid: {}", e)]))?;

    let instance = Value::Object(outputs.clone());
    let result = compiled.validate(&instance);
    if let Err(errors) = result {
        let messages: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path.trim_start_matches('/').replace('/', "."), e)
                }
            })
            .collect();
        return Err(AnnotationError::Validation(messages));
    }
    Ok(())
}

fn build_request(draft: &AnnotationDraft, evaluator: &EvaluatorRef) -> AnnotationWriteRequest {
    let link = AnnotationLink {
        trace_id: draft.trace_id.clone(),
        span_id: draft.span_id.clone(),
    };
    let mut links = HashMap::new();
    links.insert("invocation".to_string(), link);

    AnnotationWriteRequest {
        annotation: AnnotationWrite {
            data: AnnotationData {
                outputs: draft.outputs.clone(),
            },
            references: AnnotationReferences {
                evaluator: Some(EntityRef {
                    id: evaluator.id.clone(),
                    slug: Some(evaluator.slug.clone()),
                }),
                testcase: draft.testcase_id.as_ref().map(|id| EntityRef {
                    id: Some(id.clone()),
                    slug: None,
                }),
            },
            links,
            origin: "human",
            kind: "adhoc",
            channel: "web",
        },
    }
}

/// Create or update the annotation described by `draft`.
///
/// Validation failures are returned before any backend call. On success the
/// annotation and scenario caches for the draft are invalidated and the
/// scenario is stamped as recently saved.
pub async fn submit(
    session: &EvalSession,
    draft: &AnnotationDraft,
    evaluator: &EvaluatorRef,
) -> Result<Option<Annotation>, AnnotationError> {
    if let Some(schema) = evaluator.outputs_schema.as_ref() {
        validate_outputs(schema, &draft.outputs)?;
    }
    let Some(project_id) = session.project_id() else {
        return Err(AnnotationError::Submit("project id is not configured".into()));
    };

    let request = build_request(draft, evaluator);
    let backend = session.backend();
    let result = match &draft.existing {
        Some((trace_id, span_id)) => {
            backend
                .update_annotation(project_id, trace_id, span_id, &request)
                .await
        }
        None => backend.create_annotation(project_id, &request).await,
    };

    let annotation = match result {
        Ok(annotation) => annotation,
        Err(e) => {
            tracing::warn!(
                project_id,
                run_id = %draft.run_id,
                scenario_id = %draft.scenario_id,
                evaluator = %evaluator.slug,
                error = %e,
                "annotation submission failed"
            );
            return Err(AnnotationError::Submit(
                e.detail().unwrap_or_else(|| GENERIC_FAILURE.to_string()),
            ));
        }
    };

    session.invalidate_annotations(&draft.trace_id);
    if let Some((trace_id, _)) = &draft.existing {
        session.invalidate_annotations(trace_id);
    }
    session.mark_scenario_saved(&draft.scenario_id);
    session.invalidate_scenario(&draft.run_id, &draft.scenario_id);

    tracing::info!(
        project_id,
        run_id = %draft.run_id,
        scenario_id = %draft.scenario_id,
        evaluator = %evaluator.slug,
        updated = draft.existing.is_some(),
        "annotation saved"
    );
    Ok(annotation)
}
