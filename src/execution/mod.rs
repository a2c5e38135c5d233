//! Execution engine: outcome types, sandbox, output capture and coordination.

use serde::{ser::SerializeStruct, Serialize, Serializer};
use serde_json::Value;

pub mod context;
pub mod coordinator;
pub mod normalize;
pub mod output;
pub mod sandbox;

pub use context::{Capability, ContextError, ExecutionContext, HostFunction};
pub use coordinator::{Coordinator, ExecutionLimits, DEFAULT_TIMEOUT_MS};

/// Text shown in place of a return value that could not be stringified.
pub const UNSTRINGIFIABLE: &str = "Error: Could not stringify object.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The snippet threw, or the promise it returned was rejected.
    #[error("{0}")]
    Thrown(String),
    #[error("execution timed out")]
    TimedOut,
    #[error("Could not stringify object.")]
    Serialization { detail: String },
    /// The engine itself failed. Never caused by snippet code alone.
    #[error("internal error: {0}")]
    Crashed(String),
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Thrown(_) => "thrown",
            ExecutionError::TimedOut => "timeout",
            ExecutionError::Serialization { .. } => "serialization",
            ExecutionError::Crashed(_) => "internal",
        }
    }
}

impl Serialize for ExecutionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ExecutionError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

/// Result of one execution. Constructed only through the associated
/// functions below so that a timed-out run never carries a value and a
/// successful run never carries an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    return_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    console_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ExecutionError>,
}

impl ExecutionOutcome {
    pub fn completed(return_value: Option<Value>, console_output: Option<String>) -> Self {
        Self { return_value, console_output, error: None }
    }

    pub fn failed(error: ExecutionError, console_output: Option<String>) -> Self {
        Self { return_value: None, console_output, error: Some(error) }
    }

    pub fn timed_out(console_output: Option<String>) -> Self {
        Self::failed(ExecutionError::TimedOut, console_output)
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    pub fn console_output(&self) -> Option<&str> {
        self.console_output.as_deref()
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        self.error.as_ref()
    }

    pub fn status(&self) -> OutcomeStatus {
        match &self.error {
            None => OutcomeStatus::Completed,
            Some(ExecutionError::TimedOut) => OutcomeStatus::TimedOut,
            Some(_) => OutcomeStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Return value as display text. A serialization failure yields the
    /// fixed placeholder instead of nothing.
    pub fn return_value_text(&self) -> Option<String> {
        if let Some(ExecutionError::Serialization { .. }) = self.error {
            return Some(UNSTRINGIFIABLE.to_string());
        }
        self.return_value
            .as_ref()
            .map(|v| serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn status_follows_error() {
        assert_eq!(ExecutionOutcome::completed(None, None).status(), OutcomeStatus::Completed);
        assert_eq!(ExecutionOutcome::timed_out(Some("a".into())).status(), OutcomeStatus::TimedOut);
        let failed = ExecutionOutcome::failed(ExecutionError::Thrown("Error: boom".into()), None);
        assert_eq!(failed.status(), OutcomeStatus::Failed);
        assert!(!failed.is_success());
    }

    #[test]
    fn falsy_values_are_still_values() {
        let outcome = ExecutionOutcome::completed(Some(json!(0)), None);
        assert_eq!(outcome.return_value_text().as_deref(), Some("0"));
        let outcome = ExecutionOutcome::completed(Some(json!("")), None);
        assert_eq!(outcome.return_value_text().as_deref(), Some("\"\""));
    }

    #[test]
    fn serialization_failure_shows_placeholder() {
        let outcome = ExecutionOutcome::failed(
            ExecutionError::Serialization { detail: "cycle".into() },
            None,
        );
        assert_eq!(outcome.return_value(), None);
        assert_eq!(outcome.return_value_text().as_deref(), Some(UNSTRINGIFIABLE));
    }

    #[test]
    fn serializes_in_camel_case_without_absent_fields() {
        let outcome = ExecutionOutcome::failed(ExecutionError::TimedOut, Some("partial".into()));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            value,
            json!({
                "consoleOutput": "partial",
                "error": { "kind": "timeout", "message": "execution timed out" }
            })
        );
    }
}
