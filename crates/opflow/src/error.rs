use std::path::PathBuf;

use opflow_core::CoreError;
use opflow_idempotency::IdempotencyError;
use opflow_saga::{SagaError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error")]
    Config(#[from] CoreError),

    #[error("no database given; pass --database or set database_path in the config")]
    NoDatabase,

    #[error("database '{0}' does not exist")]
    DatabaseNotFound(PathBuf),

    #[error("saga ledger error")]
    Saga(#[from] SagaError),

    #[error("idempotency ledger error")]
    Idempotency(#[from] IdempotencyError),

    #[error("--params is not valid JSON")]
    InvalidParams(#[source] serde_json::Error),
}

impl From<StoreError> for CliError {
    fn from(error: StoreError) -> Self {
        Self::Saga(SagaError::Store(error))
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::path::PathBuf;

    use opflow_core::SagaId;

    use super::CliError;

    #[test]
    fn missing_database_error_includes_path() {
        let err = CliError::DatabaseNotFound(PathBuf::from("/var/lib/opflow.db"));

        assert!(err.to_string().contains("/var/lib/opflow.db"));
    }

    #[test]
    fn store_error_is_wrapped_as_saga_error() {
        let saga_id = SagaId::new();
        let err: CliError = opflow_saga::StoreError::SagaNotFound { saga_id }.into();

        assert!(matches!(err, CliError::Saga(_)));
        assert!(err.source().is_some());
    }

    #[test]
    fn invalid_params_keeps_json_error_as_source() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops")
            .expect_err("input is not JSON");

        let err = CliError::InvalidParams(json_err);

        assert!(err.to_string().contains("--params"));
        assert!(err.source().is_some());
    }
}
