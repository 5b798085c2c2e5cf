use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trace ids appear both dashed (UUID) and as bare hex; lookups use the
/// lowercase dash-free form.
pub fn canonical_trace_id(id: &str) -> String {
    id.trim().replace('-', "").to_ascii_lowercase()
}

/// Span tree of one trace as returned by the tracing query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceTree {
    #[serde(default)]
    pub spans: Value,
}

impl TraceTree {
    /// Root span: the first span object found at the top of `spans`.
    pub fn root_span(&self) -> Option<&Value> {
        match &self.spans {
            Value::Object(map) => map.values().find(|v| v.is_object()),
            Value::Array(items) => items.first(),
            _ => None,
        }
    }

    /// Outputs recorded by the root span (`attributes.ag.data.outputs`).
    pub fn root_outputs(&self) -> Option<&Value> {
        self.root_span()?
            .get("attributes")?
            .get("ag")?
            .get("data")?
            .get("outputs")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceQueryResponse {
    #[serde(default)]
    pub traces: HashMap<String, TraceTree>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceCondition {
    pub field: &'static str,
    pub operator: &'static str,
    pub value: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceFilter {
    pub conditions: Vec<TraceCondition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceQueryRequest {
    pub focus: &'static str,
    pub filter: TraceFilter,
}

impl TraceQueryRequest {
    pub fn for_trace_ids(trace_ids: Vec<String>) -> Self {
        Self {
            focus: "trace",
            filter: TraceFilter {
                conditions: vec![TraceCondition {
                    field: "trace_id",
                    operator: "in",
                    value: trace_ids,
                }],
            },
        }
    }
}
