use opflow_idempotency::IdempotencyError;
use opflow_saga::SagaError;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error("no handler is registered for operation type '{operation_type}'")]
    UnknownOperation { operation_type: String },

    #[error("operation handler '{operation_type}' is already registered")]
    DuplicateOperation { operation_type: String },

    #[error("workers are already running")]
    AlreadyStarted,

    #[error("manager is shutting down")]
    ShuttingDown,

    #[error("gave up waiting for {what} after {waited_ms}ms")]
    WaitTimedOut { what: String, waited_ms: u128 },
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_operation_names_type() {
        let err = WorkerError::UnknownOperation {
            operation_type: "billing.charge".to_string(),
        };

        assert_eq!(
            err.to_string(),
            "no handler is registered for operation type 'billing.charge'"
        );
    }
}
