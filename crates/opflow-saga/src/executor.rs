use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opflow_core::{Clock, HandlerError, SagaExecution, SagaStepExecution, StepStatus};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, SagaError};
use crate::retry::RetryPolicy;
use crate::step::{StepContext, StepHandler};
use crate::store::SagaStore;

/// Everything needed to run one step of one saga.
pub struct StepRequest<'a> {
    pub saga: &'a SagaExecution,
    pub step: &'a SagaStepExecution,
    pub handler: &'a dyn StepHandler,
    pub input: Value,
    /// Outputs of earlier steps, keyed by step name.
    pub prior_outputs: Map<String, Value>,
    /// Per-attempt budget; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// How a step ended once the executor stopped retrying it.
#[derive(Debug)]
pub enum StepOutcome {
    Completed(Value),
    /// Every attempt failed; holds [`SagaError::Exhausted`].
    Failed(SagaError),
}

/// Runs one step with bounded retries, persisting progress after every try.
///
/// The executor does not deduplicate handler side effects: a retried handler
/// runs again and must be idempotent against its own system.
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn SagaStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl StepExecutor {
    #[must_use]
    pub fn new(store: Arc<dyn SagaStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Execute the step until it succeeds or uses up `max_attempts`.
    ///
    /// A step found `running` (a worker died mid-attempt) continues from its
    /// persisted `attempt_count`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the saga ledger rejects an update; handler
    /// failures are reported through [`StepOutcome::Failed`].
    pub async fn execute_step(&self, request: StepRequest<'_>) -> Result<StepOutcome> {
        let StepRequest {
            saga,
            step,
            handler,
            input,
            prior_outputs,
            timeout,
        } = request;
        let index = step.step_index;
        let mut last_error = step.error_message.clone().map(HandlerError::new);
        let mut attempt = step.attempt_count;

        while attempt < step.max_attempts {
            attempt += 1;
            let now = self.clock.now();
            self.store.update_step(
                saga.id,
                index,
                &[StepStatus::Pending, StepStatus::Running],
                &mut |row| {
                    row.status = StepStatus::Running;
                    row.attempt_count = attempt;
                    row.started_at.get_or_insert(now);
                    row.input_data = Some(input.clone());
                    row.updated_at = now;
                },
            )?;
            debug!(saga_id = %saga.id, step = %step.step_name, attempt, "executing step");

            let ctx = StepContext {
                saga_id: saga.id,
                saga_name: saga.saga_name.clone(),
                tenant_id: saga.tenant_id.clone(),
                correlation_id: saga.correlation_id.clone(),
                step_name: step.step_name.clone(),
                step_index: index,
                attempt,
                saga_input: saga.input_data.clone(),
                prior_outputs: prior_outputs.clone(),
            };
            match bounded(timeout, handler.execute(&ctx, input.clone())).await {
                Ok(output) => {
                    let now = self.clock.now();
                    self.store
                        .update_step(saga.id, index, &[StepStatus::Running], &mut |row| {
                            row.status = StepStatus::Completed;
                            row.output_data = Some(output.clone());
                            row.error_message = None;
                            row.error_data = None;
                            row.completed_at = Some(now);
                            row.updated_at = now;
                        })?;
                    debug!(saga_id = %saga.id, step = %step.step_name, attempt, "step completed");
                    return Ok(StepOutcome::Completed(output));
                }
                Err(error) => {
                    let failure = SagaError::Execution {
                        step: step.step_name.clone(),
                        attempt,
                        source: error.clone(),
                    };
                    warn!(
                        saga_id = %saga.id,
                        max_attempts = step.max_attempts,
                        cause = %error,
                        "{failure}"
                    );
                    let now = self.clock.now();
                    self.store
                        .update_step(saga.id, index, &[StepStatus::Running], &mut |row| {
                            row.error_message = Some(error.message.clone());
                            row.error_data = Some(error.to_value());
                            row.updated_at = now;
                        })?;
                    last_error = Some(error);
                    if attempt < step.max_attempts {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }

        let source = last_error.unwrap_or_else(|| HandlerError::new("attempts exhausted"));
        let now = self.clock.now();
        self.store
            .update_step(saga.id, index, &[StepStatus::Running], &mut |row| {
                row.status = StepStatus::Failed;
                row.completed_at = Some(now);
                row.updated_at = now;
            })?;
        Ok(StepOutcome::Failed(SagaError::Exhausted {
            step: step.step_name.clone(),
            attempts: attempt,
            source,
        }))
    }
}

/// Await a handler future, failing it with a timeout error after `limit`.
pub(crate) async fn bounded<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = std::result::Result<T, HandlerError>>,
) -> std::result::Result<T, HandlerError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(HandlerError::timed_out(limit))),
        None => fut.await,
    }
}
