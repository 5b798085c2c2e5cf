use std::sync::Arc;

use thiserror::Error;

/// Failure talking to the evaluation backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("project id is not configured")]
    MissingProject,
}

impl BackendError {
    /// Best-effort extraction of a human readable message from an error body.
    ///
    /// Understands `{"detail": "..."}`, `{"detail": [{"msg": "..."}]}` and
    /// `{"message": "..."}`. Returns `None` for transport/decode failures or
    /// unstructured bodies.
    pub fn detail(&self) -> Option<String> {
        let BackendError::Status { body, .. } = self else {
            return None;
        };
        let json: serde_json::Value = serde_json::from_str(body).ok()?;

        match json.get("detail") {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(serde_json::Value::Array(items)) => {
                let msgs: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                    .collect();
                if !msgs.is_empty() {
                    return Some(msgs.join("; "));
                }
            }
            _ => {}
        }

        json.get("message")
            .and_then(|m| m.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    }
}

/// Failure of a coalesced load. The batch error is shared by every caller
/// that was waiting on the same batch.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error(transparent)]
    Batch(Arc<BackendError>),

    #[error("batch dispatcher dropped before resolving")]
    Dropped,
}

impl From<BackendError> for LoadError {
    fn from(e: BackendError) -> Self {
        LoadError::Batch(Arc::new(e))
    }
}

/// Errors surfaced to the user when submitting an annotation.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("annotation is invalid: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{0}")]
    Submit(String),
}
