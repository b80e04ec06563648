use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure reported by a step, compensation or operation handler: a message
/// plus optional structured data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Error produced when a handler does not answer within its time budget.
    #[must_use]
    pub fn timed_out(after: std::time::Duration) -> Self {
        Self::new(format!("timed out after {}ms", after.as_millis()))
    }

    /// Structured form stored in `error_data` columns.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "data": self.data,
        })
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
