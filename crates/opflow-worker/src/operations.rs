use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use opflow_core::{HandlerError, IdempotentOperation};
use serde_json::Value;

use crate::error::{Result, WorkerError};

/// What an operation handler knows about the record it is executing.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    pub idempotency_key: String,
    pub operation_type: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl From<&IdempotentOperation> for OperationContext {
    fn from(record: &IdempotentOperation) -> Self {
        Self {
            idempotency_key: record.idempotency_key.clone(),
            operation_type: record.operation_type.clone(),
            tenant_id: record.tenant_id.clone(),
            user_id: record.user_id.clone(),
            correlation_id: record.correlation_id.clone(),
            attempt: record.attempt_count,
        }
    }
}

/// Executes one kind of standalone idempotent operation.
///
/// The ledger keeps a completed result from being executed twice, but a
/// failed attempt is retried and a crash mid-attempt re-runs it.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn operation_type(&self) -> &str;

    async fn perform(
        &self,
        ctx: &OperationContext,
        parameters: Value,
    ) -> std::result::Result<Value, HandlerError>;
}

#[derive(Clone, Default)]
pub struct OperationRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operation_types", &self.operation_types())
            .finish()
    }
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`WorkerError::DuplicateOperation`] if the type is taken.
    pub fn register(&mut self, handler: impl OperationHandler + 'static) -> Result<()> {
        let operation_type = handler.operation_type().to_string();
        if self.handlers.contains_key(&operation_type) {
            return Err(WorkerError::DuplicateOperation { operation_type });
        }
        self.handlers.insert(operation_type, Arc::new(handler));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, operation_type: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(operation_type).cloned()
    }

    #[must_use]
    pub fn contains(&self, operation_type: &str) -> bool {
        self.handlers.contains_key(operation_type)
    }

    #[must_use]
    pub fn operation_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
