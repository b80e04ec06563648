use std::collections::HashSet;
use std::marker::PhantomData;

use crate::definition::{SagaDefinition, StepDefinition};
use crate::error::ValidationError;

/// Marker type for a builder with no steps.
pub struct Empty;

/// Marker type for a builder with at least one step.
pub struct HasSteps;

/// Type-state builder for saga definitions.
///
/// `build()` only exists once a step has been added, so an empty saga is
/// rejected at compile time:
///
/// ```compile_fail
/// use opflow_saga::SagaBuilder;
///
/// // Cannot build an empty saga - `build()` is only available after `step()`
/// let saga = SagaBuilder::new("tenant-provisioning").build();
/// ```
///
/// Everything else (names, uniqueness, attempt limits) is checked by `build()`:
///
/// ```
/// use opflow_saga::{SagaBuilder, StepDefinition};
///
/// let saga = SagaBuilder::new("tenant-provisioning")
///     .step(StepDefinition::new("create_db"))
///     .step(StepDefinition::new("create_admin").max_attempts(3))
///     .step(StepDefinition::new("send_welcome_email").handler("email.send"))
///     .build()
///     .expect("definition is valid");
///
/// assert_eq!(saga.steps().len(), 3);
/// ```
pub struct SagaBuilder<State> {
    name: String,
    steps: Vec<StepDefinition>,
    _state: PhantomData<State>,
}

impl SagaBuilder<Empty> {
    /// Create a new saga builder in the empty state.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            _state: PhantomData,
        }
    }
}

impl<State> SagaBuilder<State> {
    /// Append a step. Steps run in the order they are added.
    #[must_use]
    pub fn step(self, step: StepDefinition) -> SagaBuilder<HasSteps> {
        let mut steps = self.steps;
        steps.push(step);
        SagaBuilder {
            name: self.name,
            steps,
            _state: PhantomData,
        }
    }
}

impl SagaBuilder<HasSteps> {
    /// Validate and build the definition.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an empty saga or step name, a
    /// duplicate step name, or an attempt limit of zero.
    pub fn build(self) -> Result<SagaDefinition, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptySagaName);
        }

        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() || step.handler.trim().is_empty() {
                return Err(ValidationError::EmptyStepName {
                    saga: self.name.clone(),
                    index,
                });
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStep {
                    saga: self.name.clone(),
                    step: step.name.clone(),
                });
            }
            if step.max_attempts == Some(0) {
                return Err(ValidationError::ZeroAttempts {
                    step: step.name.clone(),
                    what: "attempt",
                });
            }
            if step.max_compensation_attempts == Some(0) {
                return Err(ValidationError::ZeroAttempts {
                    step: step.name.clone(),
                    what: "compensation attempt",
                });
            }
        }

        Ok(SagaDefinition {
            name: self.name,
            steps: self.steps,
        })
    }
}
