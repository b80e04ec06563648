use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opflow_core::{
    Clock, HandlerError, IdempotencyConfig, IdempotentOperation, OperationId, OperationStatus,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{IdempotencyError, Result};
use crate::key::generate_key;
use crate::store::{IdempotencyStore, InsertOutcome, Transition};

/// Outcome of [`IdempotencyLedger::create_if_absent`].
pub type CreateOutcome = InsertOutcome;

const UNFINISHED: [OperationStatus; 2] = [OperationStatus::Pending, OperationStatus::Running];

/// A request to record an idempotent operation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub operation_type: String,
    pub parameters: Value,
    pub correlation_id: Option<String>,
    pub metadata: Value,
    /// Overrides the ledger's default time-to-live.
    pub ttl: Option<Duration>,
    /// Overrides the ledger's default attempt limit.
    pub max_attempts: Option<u32>,
}

impl NewOperation {
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        operation_type: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            operation_type: operation_type.into(),
            parameters,
            correlation_id: None,
            metadata: Value::Object(serde_json::Map::new()),
            ttl: None,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// The deterministic key for this request.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        generate_key(
            &self.tenant_id,
            self.user_id.as_deref(),
            &self.operation_type,
            &self.parameters,
        )
    }
}

/// Durable key → operation-result ledger with expiry.
///
/// Creation is first-writer-wins. Completion is also first-writer-wins: once
/// a record is `completed` or `failed`, later completions are refused and the
/// stored result is what every replay observes.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl fmt::Debug for IdempotencyLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdempotencyLedger {
    #[must_use]
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// See [`generate_key`].
    #[must_use]
    pub fn generate_key(
        tenant_id: &str,
        user_id: Option<&str>,
        operation_type: &str,
        parameters: &Value,
    ) -> String {
        generate_key(tenant_id, user_id, operation_type, parameters)
    }

    /// Atomically create a `pending` record under `key` unless a live one exists.
    ///
    /// Every concurrent caller with the same key receives the same record.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn create_if_absent(&self, key: &str, request: &NewOperation) -> Result<CreateOutcome> {
        let now = self.clock.now();
        let ttl = request.ttl.unwrap_or_else(|| self.config.ttl());
        let record = IdempotentOperation {
            id: OperationId::new(),
            idempotency_key: key.to_string(),
            operation_type: request.operation_type.clone(),
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            correlation_id: request.correlation_id.clone(),
            status: OperationStatus::Pending,
            attempt_count: 0,
            max_attempts: request.max_attempts.unwrap_or(self.config.max_attempts),
            input_data: request.parameters.clone(),
            output_data: None,
            error_message: None,
            error_data: None,
            execution_time_ms: None,
            started_at: None,
            completed_at: None,
            expires_at: expiry(now, ttl),
            metadata: request.metadata.clone(),
            created_at: now,
            updated_at: now,
        };

        let outcome = self.store.insert_if_absent(record, now)?;
        debug!(
            key,
            operation_type = %request.operation_type,
            created = outcome.created,
            status = %outcome.record.status,
            "idempotency record resolved"
        );
        Ok(outcome)
    }

    /// Derive the key for `request` and create its record if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn create(&self, request: &NewOperation) -> Result<CreateOutcome> {
        self.create_if_absent(&request.idempotency_key(), request)
    }

    /// Read-only lookup; expired and missing records both yield `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn check(&self, key: &str) -> Result<Option<IdempotentOperation>> {
        let now = self.clock.now();
        Ok(self.store.get(key)?.filter(|r| !r.is_expired_at(now)))
    }

    /// Like [`check`](Self::check), but tells a missing key from an expired one.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::NotFound`] or [`IdempotencyError::Expired`].
    pub fn lookup(&self, key: &str) -> Result<IdempotentOperation> {
        let record = self
            .store
            .get(key)?
            .ok_or_else(|| IdempotencyError::NotFound {
                key: key.to_string(),
            })?;
        if record.is_expired_at(self.clock.now()) {
            return Err(IdempotencyError::Expired {
                key: key.to_string(),
                expires_at: record.expires_at,
            });
        }
        Ok(record)
    }

    /// Record the start of an execution attempt: `pending|running → running`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Exhausted`] when the record has used all
    /// of its attempts, or [`IdempotencyError::InvalidState`] when it is
    /// already terminal.
    pub fn begin_attempt(&self, key: &str) -> Result<IdempotentOperation> {
        self.lookup(key)?;
        let now = self.clock.now();
        let mut exhausted = false;
        let outcome = self.store.transition(key, &UNFINISHED, &mut |record| {
            if record.attempt_count >= record.max_attempts {
                exhausted = true;
                return;
            }
            record.status = OperationStatus::Running;
            record.attempt_count += 1;
            record.started_at.get_or_insert(now);
            record.updated_at = now;
        })?;

        let record = applied(key, outcome, "begin attempt")?;
        if exhausted {
            return Err(IdempotencyError::Exhausted {
                key: key.to_string(),
                attempts: record.attempt_count,
            });
        }
        debug!(key, attempt = record.attempt_count, "idempotent operation attempt started");
        Ok(record)
    }

    /// Persist the error of a failed attempt that will be retried. The record
    /// stays `running`; pollers see the latest error until the next outcome.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidState`] unless the record is
    /// `running`.
    pub fn record_attempt_failure(
        &self,
        key: &str,
        error: &HandlerError,
    ) -> Result<IdempotentOperation> {
        self.lookup(key)?;
        let now = self.clock.now();
        let outcome = self
            .store
            .transition(key, &[OperationStatus::Running], &mut |record| {
                record.error_message = Some(error.message.clone());
                record.error_data = Some(error.to_value());
                record.updated_at = now;
            })?;
        applied(key, outcome, "record attempt failure")
    }

    /// Transition to `completed`, persisting `result` and the execution time.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidState`] if the record is already
    /// terminal.
    pub fn complete(&self, key: &str, result: Value) -> Result<IdempotentOperation> {
        let outcome = self.finish(key, Ok(result))?;
        applied(key, outcome, "complete")
    }

    /// Transition to `failed`, persisting the handler error.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidState`] if the record is already
    /// terminal.
    pub fn fail(&self, key: &str, error: &HandlerError) -> Result<IdempotentOperation> {
        let outcome = self.finish(key, Err(error))?;
        applied(key, outcome, "fail")
    }

    /// Record the outcome of an operation: failed when `error` is given,
    /// completed with `result` otherwise.
    ///
    /// Returns `false` without touching the record when it was already
    /// terminal; the first recorded outcome wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or expired, or storage fails.
    pub fn complete_operation(
        &self,
        key: &str,
        result: Value,
        error: Option<&HandlerError>,
    ) -> Result<bool> {
        let outcome = match error {
            Some(error) => self.finish(key, Err(error))?,
            None => self.finish(key, Ok(result))?,
        };
        match outcome {
            Transition::Applied(_) => Ok(true),
            Transition::Rejected(record) => {
                warn!(key, status = %record.status, "ignoring completion of finished operation");
                Ok(false)
            }
            Transition::Missing => Err(IdempotencyError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    fn finish(
        &self,
        key: &str,
        outcome: std::result::Result<Value, &HandlerError>,
    ) -> Result<Transition> {
        self.lookup(key)?;
        let now = self.clock.now();
        let transition = self.store.transition(key, &UNFINISHED, &mut |record| {
            let started = record.started_at.unwrap_or(record.created_at);
            record.execution_time_ms =
                Some(u64::try_from((now - started).num_milliseconds()).unwrap_or(0));
            record.completed_at = Some(now);
            record.updated_at = now;
            match &outcome {
                Ok(result) => {
                    record.status = OperationStatus::Completed;
                    record.output_data = Some(result.clone());
                    record.error_message = None;
                    record.error_data = None;
                }
                Err(error) => {
                    record.status = OperationStatus::Failed;
                    record.error_message = Some(error.message.clone());
                    record.error_data = Some(error.to_value());
                }
            }
        })?;
        if let Transition::Applied(record) = &transition {
            info!(
                key,
                status = %record.status,
                execution_time_ms = record.execution_time_ms,
                "idempotent operation finished"
            );
        }
        Ok(transition)
    }

    /// Delete every record whose `expires_at` has passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn purge_expired(&self) -> Result<usize> {
        let purged = self.store.delete_expired(self.clock.now())?;
        if purged > 0 {
            info!(purged, "purged expired idempotency records");
        }
        Ok(purged)
    }

    /// Live records still `pending` or `running`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn list_unfinished(&self) -> Result<Vec<IdempotentOperation>> {
        self.store.list_by_status(&UNFINISHED, self.clock.now())
    }
}

fn applied(key: &str, outcome: Transition, action: &'static str) -> Result<IdempotentOperation> {
    match outcome {
        Transition::Applied(record) => Ok(record),
        Transition::Rejected(record) => Err(IdempotencyError::InvalidState {
            key: key.to_string(),
            status: record.status,
            action,
        }),
        Transition::Missing => Err(IdempotencyError::NotFound {
            key: key.to_string(),
        }),
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
