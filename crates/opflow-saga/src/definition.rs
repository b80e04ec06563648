use std::time::Duration;

use opflow_core::SagaConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of a saga definition.
///
/// Unset limits fall back to the engine's [`SagaConfig`] when the saga starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Registered handler name; defaults to the step name.
    pub handler: String,
    /// Fixed input for the step. When absent the step receives the saga input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_compensation_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            handler: name.clone(),
            name,
            input: None,
            max_attempts: None,
            max_compensation_attempts: None,
            timeout_ms: None,
        }
    }

    #[must_use]
    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }

    #[must_use]
    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn max_compensation_attempts(mut self, attempts: u32) -> Self {
        self.max_compensation_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub(crate) fn resolved_max_attempts(&self, config: &SagaConfig) -> u32 {
        self.max_attempts.unwrap_or(config.default_max_attempts)
    }

    pub(crate) fn resolved_max_compensation_attempts(&self, config: &SagaConfig) -> u32 {
        self.max_compensation_attempts
            .unwrap_or(config.default_max_compensation_attempts)
    }

    /// Per-attempt budget; a step-level timeout overrides the engine default.
    pub(crate) fn resolved_timeout(&self, config: &SagaConfig) -> Option<Duration> {
        match self.timeout_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => config.step_timeout(),
        }
    }
}

/// A validated, ordered list of steps under a saga name.
///
/// Built with [`SagaBuilder`](crate::SagaBuilder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub(crate) name: String,
    pub(crate) steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }
}
