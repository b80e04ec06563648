use opflow_core::{CoreError, HandlerError, SagaId, SagaStatus, StepStatus};
use thiserror::Error;

/// A saga definition or handler registration that cannot run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("saga name must not be empty")]
    EmptySagaName,

    #[error("step {index} of saga '{saga}' has an empty name")]
    EmptyStepName { saga: String, index: usize },

    #[error("saga '{saga}' defines step '{step}' more than once")]
    DuplicateStep { saga: String, step: String },

    #[error("step '{step}' must allow at least one {what}")]
    ZeroAttempts { step: String, what: &'static str },

    #[error("step '{step}' uses handler '{handler}', which is not registered")]
    UnregisteredHandler { step: String, handler: String },

    #[error("handler '{name}' is already registered")]
    DuplicateHandler { name: String },
}

/// Failure in the saga ledger.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("saga {saga_id} not found")]
    SagaNotFound { saga_id: SagaId },

    #[error("saga {saga_id} has no step at index {index}")]
    StepNotFound { saga_id: SagaId, index: usize },

    #[error("saga {saga_id} already exists")]
    DuplicateSaga { saga_id: SagaId },

    /// Completed and compensated sagas are immutable.
    #[error("saga {saga_id} is {status} and can no longer change")]
    Terminal { saga_id: SagaId, status: SagaStatus },

    #[error("saga {saga_id} is {actual}, expected one of {expected:?}")]
    SagaConflict {
        saga_id: SagaId,
        expected: Vec<SagaStatus>,
        actual: SagaStatus,
    },

    #[error("step {index} of saga {saga_id} is {actual}, expected one of {expected:?}")]
    StepConflict {
        saga_id: SagaId,
        index: usize,
        expected: Vec<StepStatus>,
        actual: StepStatus,
    },

    #[error("step {index} of saga {saga_id} cannot run before step {blocking} is completed")]
    OutOfOrder {
        saga_id: SagaId,
        index: usize,
        blocking: usize,
    },

    #[error("saga {saga_id}: current step index {index} exceeds {total} step(s)")]
    IndexOutOfRange {
        saga_id: SagaId,
        index: usize,
        total: usize,
    },

    #[error("failed to encode or decode saga payload")]
    Serialization(#[from] serde_json::Error),

    #[error("saga storage error")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Error from a failed compensation attempt.
#[derive(Debug, Clone, Error)]
#[error("compensation failed for step '{step}': {description}")]
pub struct CompensationError {
    /// Name of the step whose compensation failed.
    pub step: String,
    /// What the compensation was trying to do.
    pub description: String,
    pub attempt: u32,
    #[source]
    pub error: HandlerError,
}

/// Error from saga execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SagaError {
    #[error("invalid saga definition")]
    Validation(#[from] ValidationError),

    /// A single step attempt failed.
    #[error("step '{step}' failed on attempt {attempt}")]
    Execution {
        step: String,
        attempt: u32,
        #[source]
        source: HandlerError,
    },

    /// A step used every attempt it was allowed.
    #[error("step '{step}' failed after {attempts} attempt(s)")]
    Exhausted {
        step: String,
        attempts: u32,
        #[source]
        source: HandlerError,
    },

    #[error(transparent)]
    Compensation(#[from] CompensationError),

    /// Compensation gave up; the saga is stuck in `compensating`.
    #[error("compensation of step '{step}' exhausted {attempts} attempt(s)")]
    CompensationExhausted {
        step: String,
        attempts: u32,
        #[source]
        source: CompensationError,
    },

    #[error("saga {saga_id} has an unreadable step plan")]
    InvalidPlan {
        saga_id: SagaId,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot {action} saga {saga_id}: {reason}")]
    InvalidOperation {
        saga_id: SagaId,
        action: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SagaError>;
