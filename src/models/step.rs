//! Scenario step results, scenarios and testcases.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Statuses meaning a scenario or step finished executing.
pub const TERMINAL_STATUSES: &[&str] = &[
    "success",
    "completed",
    "finished",
    "done",
    "failed",
    "error",
    "failure",
];

const FAILED_STATUSES: &[&str] = &["failed", "error", "failure", "errors"];

pub fn is_terminal_status(status: Option<&str>) -> bool {
    status
        .map(|s| TERMINAL_STATUSES.contains(&s.trim().to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// One typed stage of a scenario's execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub scenario_id: String,
    #[serde(default)]
    pub step_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testcase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

/// Failure reported by a step execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepError {
    pub step_key: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl StepResult {
    /// The step's failure, if its status or error payload says it failed.
    pub fn failure(&self) -> Option<StepError> {
        let failed_status = self
            .status
            .as_deref()
            .map(|s| FAILED_STATUSES.contains(&s.trim().to_ascii_lowercase().as_str()))
            .unwrap_or(false);

        let (message, stacktrace) = match &self.error {
            Some(Value::String(s)) if !s.is_empty() => (Some(s.clone()), None),
            Some(Value::Object(map)) => (
                map.get("message").and_then(Value::as_str).map(String::from),
                map.get("stacktrace").and_then(Value::as_str).map(String::from),
            ),
            _ => (None, None),
        };

        if !failed_status && message.is_none() {
            return None;
        }

        Some(StepError {
            step_key: self.step_key.clone(),
            message: message.unwrap_or_else(|| "step execution failed".to_string()),
            stacktrace,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultQueryFilter {
    pub run_id: String,
    pub scenario_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultQueryRequest {
    pub result: ResultQueryFilter,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsResponse {
    #[serde(default)]
    pub results: Vec<StepResult>,
}

/// Scenario header: the execution status of one testcase within a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioInfo {
    pub id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioQueryFilter {
    pub ids: Vec<String>,
    pub run_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioQueryRequest {
    pub scenario: ScenarioQueryFilter,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScenariosResponse {
    #[serde(default)]
    pub scenarios: Vec<ScenarioInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Testcase {
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestcaseQueryRequest {
    pub testcase_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestcasesResponse {
    #[serde(default)]
    pub testcases: Vec<Testcase>,
}
