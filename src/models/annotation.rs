use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reference to the trace (and optionally span) an annotation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotationLink {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl AnnotationLink {
    pub fn trace(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationData {
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationReferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testcase: Option<EntityRef>,
}

/// An annotation as stored by the backend. The annotation itself is a
/// trace; `links` points at the traces it annotates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default)]
    pub data: AnnotationData,
    #[serde(default)]
    pub references: AnnotationReferences,
    #[serde(default)]
    pub links: HashMap<String, AnnotationLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Annotation {
    pub fn evaluator_slug(&self) -> Option<&str> {
        self.references.evaluator.as_ref()?.slug.as_deref()
    }

    /// Every trace id this annotation can be found under.
    pub fn linked_trace_ids(&self) -> impl Iterator<Item = &str> {
        self.trace_id
            .as_deref()
            .into_iter()
            .chain(self.links.values().map(|l| l.trace_id.as_str()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotationQueryRequest {
    pub annotation_links: Vec<AnnotationLink>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnotationsResponse {
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// Body for creating or updating an annotation.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotationWrite {
    pub data: AnnotationData,
    pub references: AnnotationReferences,
    pub links: HashMap<String, AnnotationLink>,
    pub origin: &'static str,
    pub kind: &'static str,
    pub channel: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotationWriteRequest {
    pub annotation: AnnotationWrite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnotationResponse {
    #[serde(default)]
    pub annotation: Option<Annotation>,
}
