use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One backend-persisted metric document.
///
/// `data` is keyed by step key, then metric key, and holds raw (not yet
/// normalized) stat leaves. A record with no `scenario_id` is a run-level
/// aggregate; a run-level record carrying a `timestamp` belongs to a
/// streaming evaluation's temporal series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

impl MetricRecord {
    /// Step map of the payload; empty for `null` or non-object data.
    pub fn steps(&self) -> Option<&Map<String, Value>> {
        self.data.as_object()
    }

    pub fn is_run_level(&self) -> bool {
        self.scenario_id.is_none()
    }

    /// Canonical run-level entry: no scenario and no timestamp.
    pub fn is_static_run_level(&self) -> bool {
        self.is_run_level() && self.timestamp_ms().is_none()
    }

    pub fn is_temporal(&self) -> bool {
        self.is_run_level() && self.timestamp_ms().is_some()
    }

    /// Lowercased producer status, `None` when absent or blank.
    pub fn normalized_status(&self) -> Option<String> {
        self.status
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
    }

    /// Timestamp as epoch milliseconds. Accepts RFC 3339 strings, numeric
    /// strings and numbers (seconds are promoted when clearly not ms).
    pub fn timestamp_ms(&self) -> Option<i64> {
        parse_timestamp_ms(self.timestamp.as_ref()?)
    }
}

pub(crate) fn parse_timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().map(epoch_to_ms),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(n) = s.parse::<f64>() {
                return Some(epoch_to_ms(n));
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
                .or_else(|| {
                    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|dt| dt.and_utc().timestamp_millis())
                })
        }
        _ => None,
    }
}

fn epoch_to_ms(n: f64) -> i64 {
    // Anything below ~2001-09 in ms is assumed to be seconds.
    if n.abs() < 1.0e12 {
        (n * 1000.0) as i64
    } else {
        n as i64
    }
}

/// Which aggregate a metric record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricScope {
    Run,
    Scenario,
}

impl std::fmt::Display for MetricScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricScope::Run => write!(f, "run"),
            MetricScope::Scenario => write!(f, "scenario"),
        }
    }
}

/// How the evaluation run produces its results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationType {
    #[default]
    Auto,
    Human,
    /// Streaming evaluation emitting timestamped run-level metrics.
    Online,
    Custom,
}

impl EvaluationType {
    pub fn is_human(self) -> bool {
        self == EvaluationType::Human
    }

    pub fn is_streaming(self) -> bool {
        self == EvaluationType::Online
    }
}

impl std::str::FromStr for EvaluationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "automatic" => Ok(EvaluationType::Auto),
            "human" | "manual" => Ok(EvaluationType::Human),
            "online" | "live" | "streaming" => Ok(EvaluationType::Online),
            "custom" => Ok(EvaluationType::Custom),
            other => Err(format!("unknown evaluation type '{}'", other)),
        }
    }
}

// ── Wire envelopes ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricQueryFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_ids: Option<Vec<String>>,
    pub run_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricQueryRequest {
    pub metric: MetricQueryFilter,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsResponse {
    #[serde(default)]
    pub metrics: Vec<MetricRecord>,
}

/// What a refresh call asks the backend to recompute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTarget {
    Run { run_id: String },
    Scenario { run_id: String, scenario_id: String },
    Scenarios { run_id: String, scenario_ids: Vec<String> },
}

impl RefreshTarget {
    pub fn run_id(&self) -> &str {
        match self {
            RefreshTarget::Run { run_id }
            | RefreshTarget::Scenario { run_id, .. }
            | RefreshTarget::Scenarios { run_id, .. } => run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshBody {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricRefreshRequest {
    pub metrics: RefreshBody,
}

impl From<&RefreshTarget> for MetricRefreshRequest {
    fn from(target: &RefreshTarget) -> Self {
        let metrics = match target {
            RefreshTarget::Run { run_id } => RefreshBody {
                run_id: run_id.clone(),
                scenario_id: None,
                scenario_ids: None,
            },
            RefreshTarget::Scenario {
                run_id,
                scenario_id,
            } => RefreshBody {
                run_id: run_id.clone(),
                scenario_id: Some(scenario_id.clone()),
                scenario_ids: None,
            },
            RefreshTarget::Scenarios {
                run_id,
                scenario_ids,
            } => RefreshBody {
                run_id: run_id.clone(),
                scenario_id: None,
                scenario_ids: Some(scenario_ids.clone()),
            },
        };
        Self { metrics }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricDeleteRequest {
    pub metrics_ids: Vec<String>,
}
