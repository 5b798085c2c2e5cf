//! Coalesced loaders for traces, annotations, scenario steps and testcases.
//!
//! None of these reconcile anything: they fetch a set of ids, group the
//! response by the id each entry correlates to, and leave unmatched ids
//! out of the map so they resolve to `None`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use super::coalescer::BatchLoader;
use crate::api::EvalBackend;
use crate::errors::BackendError;
use crate::models::annotation::{Annotation, AnnotationLink};
use crate::models::step::{StepResult, Testcase};
use crate::models::trace::{canonical_trace_id, TraceTree};

pub struct TraceLoader {
    backend: Arc<dyn EvalBackend>,
    project_id: String,
}

impl TraceLoader {
    pub fn new(backend: Arc<dyn EvalBackend>, project_id: impl Into<String>) -> Self {
        Self {
            backend,
            project_id: project_id.into(),
        }
    }
}

#[async_trait]
impl BatchLoader for TraceLoader {
    type Key = String;
    type Value = TraceTree;

    fn key_id(&self, key: &String) -> String {
        canonical_trace_id(key)
    }

    async fn load(&self, keys: Vec<String>) -> Result<HashMap<String, TraceTree>, BackendError> {
        let resp = self.backend.query_traces(&self.project_id, &keys).await?;
        tracing::debug!(
            project_id = %self.project_id,
            requested = keys.len(),
            returned = resp.traces.len(),
            "loaded traces"
        );
        Ok(resp
            .traces
            .into_iter()
            .map(|(id, tree)| (canonical_trace_id(&id), tree))
            .collect())
    }
}

pub struct AnnotationLoader {
    backend: Arc<dyn EvalBackend>,
    project_id: String,
}

impl AnnotationLoader {
    pub fn new(backend: Arc<dyn EvalBackend>, project_id: impl Into<String>) -> Self {
        Self {
            backend,
            project_id: project_id.into(),
        }
    }
}

#[async_trait]
impl BatchLoader for AnnotationLoader {
    type Key = AnnotationLink;
    type Value = Vec<Annotation>;

    fn key_id(&self, key: &AnnotationLink) -> String {
        canonical_trace_id(&key.trace_id)
    }

    async fn load(&self, keys: Vec<AnnotationLink>) -> Result<HashMap<String, Vec<Annotation>>, BackendError> {
        let annotations = self.backend.query_annotations(&self.project_id, &keys).await?;
        Ok(index_annotations(annotations))
    }
}

/// Index each annotation under its own trace id and every linked trace
/// id, in both original and canonical form.
pub fn index_annotations(annotations: Vec<Annotation>) -> HashMap<String, Vec<Annotation>> {
    let mut index: HashMap<String, Vec<Annotation>> = HashMap::new();
    for annotation in annotations {
        let mut ids: HashSet<String> = HashSet::new();
        for id in annotation.linked_trace_ids() {
            ids.insert(id.to_string());
            ids.insert(canonical_trace_id(id));
        }
        for id in ids {
            index.entry(id).or_default().push(annotation.clone());
        }
    }
    index
}

/// Step results of one run, grouped by scenario.
pub struct StepLoader {
    backend: Arc<dyn EvalBackend>,
    project_id: String,
    run_id: String,
}

impl StepLoader {
    pub fn new(backend: Arc<dyn EvalBackend>, project_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            backend,
            project_id: project_id.into(),
            run_id: run_id.into(),
        }
    }
}

#[async_trait]
impl BatchLoader for StepLoader {
    type Key = String;
    type Value = Vec<StepResult>;

    fn key_id(&self, key: &String) -> String {
        key.clone()
    }

    async fn load(&self, keys: Vec<String>) -> Result<HashMap<String, Vec<StepResult>>, BackendError> {
        let requested: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let results = self
            .backend
            .query_results(&self.project_id, &self.run_id, &keys)
            .await?;

        let mut grouped: HashMap<String, Vec<StepResult>> = HashMap::new();
        for step in results {
            if requested.contains(step.scenario_id.as_str()) {
                grouped.entry(step.scenario_id.clone()).or_default().push(step);
            }
        }
        Ok(grouped)
    }
}

pub struct TestcaseLoader {
    backend: Arc<dyn EvalBackend>,
    project_id: String,
}

impl TestcaseLoader {
    pub fn new(backend: Arc<dyn EvalBackend>, project_id: impl Into<String>) -> Self {
        Self {
            backend,
            project_id: project_id.into(),
        }
    }
}

#[async_trait]
impl BatchLoader for TestcaseLoader {
    type Key = String;
    type Value = Testcase;

    fn key_id(&self, key: &String) -> String {
        key.clone()
    }

    async fn load(&self, keys: Vec<String>) -> Result<HashMap<String, Testcase>, BackendError> {
        let testcases = self.backend.query_testcases(&self.project_id, &keys).await?;
        Ok(testcases.into_iter().map(|tc| (tc.id.clone(), tc)).collect())
    }
}
