use std::sync::Arc;

use opflow_core::{
    Clock, HandlerError, OpflowConfig, SagaConfig, SagaExecution, SagaId, SagaStatus,
    SagaStepExecution, StepExecutionId, StepStatus,
};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::alert::{AlertSink, OperatorAlert, TracingAlertSink};
use crate::audit::SagaAuditLog;
use crate::compensation::{CompensationCoordinator, CompensationOutcome};
use crate::definition::{SagaDefinition, StepDefinition};
use crate::error::{CompensationError, Result, SagaError, StoreError, ValidationError};
use crate::executor::{StepExecutor, StepOutcome, StepRequest};
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::store::{SagaFilter, SagaStore};

/// Per-instance parameters for [`SagaEngine::start_saga`].
#[derive(Debug, Clone, PartialEq)]
pub struct SagaStart {
    pub tenant_id: String,
    pub input: Value,
    /// Defaults to the saga id.
    pub correlation_id: Option<String>,
    pub metadata: Value,
}

impl SagaStart {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, input: Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            input,
            correlation_id: None,
            metadata: Value::Object(Map::new()),
        }
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
}

/// What a single [`SagaEngine::advance`] call did.
#[derive(Debug)]
pub enum SagaProgress {
    /// `pending → running`.
    Started,
    StepCompleted { index: usize, step: String },
    /// An administratively skipped step was passed over.
    StepSkipped { index: usize, step: String },
    /// A step exhausted its attempts; the saga is now `compensating`.
    StepFailed {
        index: usize,
        step: String,
        error: SagaError,
    },
    /// A saga found `failed` was moved on to `compensating`.
    CompensationStarted,
    Completed,
    Compensated,
    /// Compensation is exhausted; the saga stays `compensating` until an
    /// operator calls [`SagaEngine::retry_compensation`].
    CompensationStalled { step: String, error: SagaError },
    /// The saga was already terminal.
    Finished(SagaStatus),
}

impl SagaProgress {
    /// Whether advancing again would do nothing without outside help.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Compensated | Self::CompensationStalled { .. } | Self::Finished(_)
        )
    }
}

/// The saga state machine.
///
/// `pending → running → completed` on the happy path;
/// `running → failed → compensating → compensated` when a step exhausts its
/// attempts. All state lives in the [`SagaStore`], so any engine instance can
/// pick up any saga, as long as only one advances a given saga at a time.
pub struct SagaEngine {
    store: Arc<dyn SagaStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: SagaConfig,
    executor: StepExecutor,
    coordinator: CompensationCoordinator,
    alerts: Arc<dyn AlertSink>,
}

impl SagaEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn SagaStore>,
        registry: HandlerRegistry,
        clock: Arc<dyn Clock>,
        config: &OpflowConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let retry = RetryPolicy::from(&config.retry);
        Self {
            executor: StepExecutor::new(store.clone(), clock.clone(), retry),
            coordinator: CompensationCoordinator::new(
                store.clone(),
                registry.clone(),
                clock.clone(),
                retry,
                config.saga.clone(),
            ),
            store,
            registry,
            clock,
            config: config.saga.clone(),
            alerts: Arc::new(TracingAlertSink),
        }
    }

    #[must_use]
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.executor = StepExecutor::new(self.store.clone(), self.clock.clone(), retry);
        self.coordinator = CompensationCoordinator::new(
            self.store.clone(),
            self.registry.clone(),
            self.clock.clone(),
            retry,
            self.config.clone(),
        );
        self
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Validate `definition` against the registry and persist a `pending` saga.
    ///
    /// Nothing is persisted when validation fails.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Validation`] if a step names an unregistered
    /// handler, or a store error.
    pub fn start_saga(&self, definition: &SagaDefinition, start: SagaStart) -> Result<SagaId> {
        self.registry.validate(definition)?;

        let id = SagaId::new();
        let now = self.clock.now();
        let plan = serde_json::to_value(definition.steps())
            .map_err(|source| SagaError::InvalidPlan { saga_id: id, source })?;
        let saga = SagaExecution {
            id,
            saga_name: definition.name().to_string(),
            tenant_id: start.tenant_id,
            correlation_id: start.correlation_id.unwrap_or_else(|| id.to_string()),
            status: SagaStatus::Pending,
            current_step: None,
            current_step_index: 0,
            total_steps: definition.steps().len(),
            input_data: start.input,
            output_data: None,
            error_data: None,
            context_data: json!({ "plan": plan }),
            metadata: start.metadata,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        let steps: Vec<_> = definition
            .steps()
            .iter()
            .enumerate()
            .map(|(index, step)| SagaStepExecution {
                id: StepExecutionId::new(),
                saga_id: id,
                step_name: step.name.clone(),
                step_index: index,
                status: StepStatus::Pending,
                attempt_count: 0,
                max_attempts: step.resolved_max_attempts(&self.config),
                input_data: None,
                output_data: None,
                error_message: None,
                error_data: None,
                compensation_data: None,
                compensation_attempts: 0,
                max_compensation_attempts: step.resolved_max_compensation_attempts(&self.config),
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.store.insert_saga(&saga, &steps)?;
        info!(
            saga_id = %id,
            saga = %saga.saga_name,
            tenant = %saga.tenant_id,
            steps = saga.total_steps,
            "saga created"
        );
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::SagaNotFound`] for an unknown id.
    pub fn get_saga_status(&self, saga_id: SagaId) -> Result<SagaExecution> {
        Ok(self
            .store
            .get_saga(saga_id)?
            .ok_or(StoreError::SagaNotFound { saga_id })?)
    }

    /// # Errors
    ///
    /// Returns an error if the saga ledger fails.
    pub fn get_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepExecution>> {
        Ok(self.store.get_steps(saga_id)?)
    }

    /// # Errors
    ///
    /// Returns an error if the saga ledger fails.
    pub fn audit_log(&self, saga_id: SagaId) -> Result<SagaAuditLog> {
        Ok(SagaAuditLog::from_steps(&self.get_steps(saga_id)?))
    }

    /// # Errors
    ///
    /// Returns an error if the saga ledger fails.
    pub fn list_sagas(&self, filter: &SagaFilter) -> Result<Vec<SagaExecution>> {
        Ok(self.store.list_sagas(filter)?)
    }

    /// Sagas stuck in `compensating` behind an exhausted compensation.
    ///
    /// # Errors
    ///
    /// Returns an error if the saga ledger fails.
    pub fn stalled_sagas(&self) -> Result<Vec<SagaExecution>> {
        let compensating = self
            .store
            .list_sagas(&SagaFilter::default().status(SagaStatus::Compensating))?;
        let mut stalled = Vec::new();
        for saga in compensating {
            if stalled_step(&self.store.get_steps(saga.id)?).is_some() {
                stalled.push(saga);
            }
        }
        Ok(stalled)
    }

    /// Perform one unit of work on the saga: start it, run its current
    /// step, or run a compensation pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the saga is unknown, its plan is unreadable, a
    /// handler is no longer registered, or the ledger rejects an update.
    pub async fn advance(&self, saga_id: SagaId) -> Result<SagaProgress> {
        let saga = self.get_saga_status(saga_id)?;
        match saga.status {
            SagaStatus::Completed | SagaStatus::Compensated => Ok(SagaProgress::Finished(saga.status)),
            SagaStatus::Pending => self.start(&saga),
            SagaStatus::Running => self.run_current_step(&saga).await,
            SagaStatus::Failed => {
                self.store
                    .update_saga(saga_id, &[SagaStatus::Failed], &mut |s| {
                        s.status = SagaStatus::Compensating;
                        s.updated_at = self.clock.now();
                    })?;
                info!(saga_id = %saga_id, "saga compensating");
                Ok(SagaProgress::CompensationStarted)
            }
            SagaStatus::Compensating => self.compensate(&saga).await,
        }
    }

    /// Advance until the saga completes, is compensated, or stalls.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`advance`](Self::advance).
    pub async fn run_to_completion(&self, saga_id: SagaId) -> Result<SagaExecution> {
        loop {
            if self.advance(saga_id).await?.is_final() {
                return self.get_saga_status(saga_id);
            }
        }
    }

    /// Mark a pending step `skipped`. It will be passed over and never
    /// compensated.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::InvalidOperation`] if the saga is no longer
    /// moving forward or the step has already been reached.
    pub fn skip_step(&self, saga_id: SagaId, index: usize) -> Result<SagaStepExecution> {
        let saga = self.get_saga_status(saga_id)?;
        if !matches!(saga.status, SagaStatus::Pending | SagaStatus::Running) {
            return Err(SagaError::InvalidOperation {
                saga_id,
                action: "skip step of",
                reason: format!("saga is {}", saga.status),
            });
        }
        let now = self.clock.now();
        let step = self
            .store
            .update_step(saga_id, index, &[StepStatus::Pending], &mut |row| {
                row.status = StepStatus::Skipped;
                row.completed_at = Some(now);
                row.updated_at = now;
            })?;
        info!(saga_id = %saga_id, step = %step.step_name, "step skipped");
        Ok(step)
    }

    /// Reset the exhausted compensation counter of a stalled saga so the
    /// next [`advance`](Self::advance) retries the rollback.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::InvalidOperation`] if the saga is not stalled.
    pub fn retry_compensation(&self, saga_id: SagaId) -> Result<SagaStepExecution> {
        let saga = self.get_saga_status(saga_id)?;
        let steps = self.store.get_steps(saga_id)?;
        let stuck = match (saga.status, stalled_step(&steps)) {
            (SagaStatus::Compensating, Some(stuck)) => stuck,
            _ => {
                return Err(SagaError::InvalidOperation {
                    saga_id,
                    action: "retry compensation of",
                    reason: format!("saga is {} with no exhausted compensation", saga.status),
                });
            }
        };
        let now = self.clock.now();
        let step = self.store.update_step(
            saga_id,
            stuck.step_index,
            &[StepStatus::Compensating],
            &mut |row| {
                row.compensation_attempts = 0;
                row.updated_at = now;
            },
        )?;
        info!(saga_id = %saga_id, step = %step.step_name, "compensation re-armed");
        Ok(step)
    }

    fn start(&self, saga: &SagaExecution) -> Result<SagaProgress> {
        let plan = plan_of(saga)?;
        let now = self.clock.now();
        self.store
            .update_saga(saga.id, &[SagaStatus::Pending], &mut |s| {
                s.status = SagaStatus::Running;
                s.current_step_index = 0;
                s.current_step = plan.first().map(|step| step.name.clone());
                s.started_at = Some(now);
                s.updated_at = now;
            })?;
        info!(saga_id = %saga.id, saga = %saga.saga_name, "saga started");
        Ok(SagaProgress::Started)
    }

    async fn run_current_step(&self, saga: &SagaExecution) -> Result<SagaProgress> {
        let steps = self.store.get_steps(saga.id)?;
        let index = saga.current_step_index;
        let Some(step) = steps.get(index) else {
            return self.complete(saga);
        };

        match step.status {
            // A crash between finishing the step and moving the saga on.
            StepStatus::Completed => self.move_past(
                saga,
                &steps,
                SagaProgress::StepCompleted {
                    index,
                    step: step.step_name.clone(),
                },
            ),
            StepStatus::Skipped => self.move_past(
                saga,
                &steps,
                SagaProgress::StepSkipped {
                    index,
                    step: step.step_name.clone(),
                },
            ),
            StepStatus::Pending | StepStatus::Running => {
                let plan = plan_of(saga)?;
                let definition = plan.get(index).ok_or(StoreError::StepNotFound {
                    saga_id: saga.id,
                    index,
                })?;
                let handler = self.registry.get(&definition.handler).ok_or_else(|| {
                    ValidationError::UnregisteredHandler {
                        step: definition.name.clone(),
                        handler: definition.handler.clone(),
                    }
                })?;
                let outcome = self
                    .executor
                    .execute_step(StepRequest {
                        saga,
                        step,
                        handler: handler.as_ref(),
                        input: definition
                            .input
                            .clone()
                            .unwrap_or_else(|| saga.input_data.clone()),
                        prior_outputs: completed_outputs(&steps[..index]),
                        timeout: definition.resolved_timeout(&self.config),
                    })
                    .await?;
                match outcome {
                    StepOutcome::Completed(_) => self.move_past(
                        saga,
                        &steps,
                        SagaProgress::StepCompleted {
                            index,
                            step: step.step_name.clone(),
                        },
                    ),
                    StepOutcome::Failed(error) => self.fail(saga, step, error),
                }
            }
            // A crash between failing the step and failing the saga.
            StepStatus::Failed => {
                let error = SagaError::Exhausted {
                    step: step.step_name.clone(),
                    attempts: step.attempt_count,
                    source: HandlerError::new(
                        step.error_message.clone().unwrap_or_else(|| "step failed".to_string()),
                    ),
                };
                self.fail(saga, step, error)
            }
            StepStatus::Compensating | StepStatus::Compensated => {
                Err(SagaError::InvalidOperation {
                    saga_id: saga.id,
                    action: "advance",
                    reason: format!("step '{}' is {} while the saga runs", step.step_name, step.status),
                })
            }
        }
    }

    fn move_past(
        &self,
        saga: &SagaExecution,
        steps: &[SagaStepExecution],
        passed: SagaProgress,
    ) -> Result<SagaProgress> {
        let next = saga.current_step_index + 1;
        if next >= saga.total_steps {
            return self.complete(saga);
        }
        let now = self.clock.now();
        let next_name = steps.get(next).map(|s| s.step_name.clone());
        self.store
            .update_saga(saga.id, &[SagaStatus::Running], &mut |s| {
                s.current_step_index = next;
                s.current_step = next_name.clone();
                s.updated_at = now;
            })?;
        Ok(passed)
    }

    fn complete(&self, saga: &SagaExecution) -> Result<SagaProgress> {
        let outputs = completed_outputs(&self.store.get_steps(saga.id)?);
        let now = self.clock.now();
        self.store
            .update_saga(saga.id, &[SagaStatus::Running], &mut |s| {
                s.status = SagaStatus::Completed;
                s.current_step_index = s.total_steps;
                s.current_step = None;
                s.output_data = Some(Value::Object(outputs.clone()));
                s.completed_at = Some(now);
                s.updated_at = now;
            })?;
        info!(saga_id = %saga.id, saga = %saga.saga_name, "saga completed");
        Ok(SagaProgress::Completed)
    }

    /// `running → failed → compensating`, recording why in `error_data`.
    fn fail(
        &self,
        saga: &SagaExecution,
        step: &SagaStepExecution,
        error: SagaError,
    ) -> Result<SagaProgress> {
        let cause = std::error::Error::source(&error).map(ToString::to_string);
        let error_data = json!({
            "step": step.step_name,
            "step_index": step.step_index,
            "message": error.to_string(),
            "cause": cause,
        });
        let now = self.clock.now();
        self.store
            .update_saga(saga.id, &[SagaStatus::Running], &mut |s| {
                s.status = SagaStatus::Failed;
                s.error_data = Some(error_data.clone());
                s.updated_at = now;
            })?;
        warn!(saga_id = %saga.id, step = %step.step_name, error = %error, "saga failed");
        self.store
            .update_saga(saga.id, &[SagaStatus::Failed], &mut |s| {
                s.status = SagaStatus::Compensating;
                s.updated_at = now;
            })?;
        info!(saga_id = %saga.id, "saga compensating");
        Ok(SagaProgress::StepFailed {
            index: step.step_index,
            step: step.step_name.clone(),
            error,
        })
    }

    async fn compensate(&self, saga: &SagaExecution) -> Result<SagaProgress> {
        let steps = self.store.get_steps(saga.id)?;
        if let Some(stuck) = stalled_step(&steps) {
            return Ok(stalled_progress(stuck, None));
        }

        let plan = plan_of(saga)?;
        match self.coordinator.compensate(saga, &steps, &plan).await? {
            CompensationOutcome::Completed { .. } => {
                let now = self.clock.now();
                self.store
                    .update_saga(saga.id, &[SagaStatus::Compensating], &mut |s| {
                        s.status = SagaStatus::Compensated;
                        s.current_step = None;
                        s.completed_at = Some(now);
                        s.updated_at = now;
                    })?;
                info!(saga_id = %saga.id, saga = %saga.saga_name, "saga compensated");
                Ok(SagaProgress::Compensated)
            }
            CompensationOutcome::Halted { step, error } => {
                self.raise_alert(saga, &step, &error)?;
                Ok(stalled_progress(&step, Some(error)))
            }
        }
    }

    fn raise_alert(
        &self,
        saga: &SagaExecution,
        step: &SagaStepExecution,
        error: &CompensationError,
    ) -> Result<()> {
        let alert = OperatorAlert {
            saga_id: saga.id,
            saga_name: saga.saga_name.clone(),
            tenant_id: saga.tenant_id.clone(),
            step: step.step_name.clone(),
            step_index: step.step_index,
            attempts: step.compensation_attempts,
            message: format!("{error}: {}", error.error),
            raised_at: self.clock.now(),
        };
        self.alerts.raise(&alert);

        let alert_value = serde_json::to_value(&alert).map_err(StoreError::from)?;
        self.store
            .update_saga(saga.id, &[SagaStatus::Compensating], &mut |s| {
                let mut data = match s.error_data.take() {
                    Some(Value::Object(map)) => map,
                    Some(other) => Map::from_iter([("error".to_string(), other)]),
                    None => Map::new(),
                };
                data.insert("alert".to_string(), alert_value.clone());
                s.error_data = Some(Value::Object(data));
                s.updated_at = alert.raised_at;
            })?;
        Ok(())
    }
}

fn plan_of(saga: &SagaExecution) -> Result<Vec<StepDefinition>> {
    let plan = saga.context_data.get("plan").cloned().unwrap_or(Value::Null);
    serde_json::from_value(plan).map_err(|source| SagaError::InvalidPlan {
        saga_id: saga.id,
        source,
    })
}

fn completed_outputs(steps: &[SagaStepExecution]) -> Map<String, Value> {
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .filter_map(|s| Some((s.step_name.clone(), s.output_data.clone()?)))
        .collect()
}

fn stalled_step(steps: &[SagaStepExecution]) -> Option<&SagaStepExecution> {
    steps
        .iter()
        .find(|s| s.status == StepStatus::Compensating && s.compensation_exhausted())
}

fn stalled_progress(step: &SagaStepExecution, error: Option<CompensationError>) -> SagaProgress {
    let source = error.unwrap_or_else(|| CompensationError {
        step: step.step_name.clone(),
        description: format!("undo {}", step.step_name),
        attempt: step.compensation_attempts,
        error: HandlerError::new(
            step.error_message
                .clone()
                .unwrap_or_else(|| "compensation exhausted".to_string()),
        ),
    });
    SagaProgress::CompensationStalled {
        step: step.step_name.clone(),
        error: SagaError::CompensationExhausted {
            step: step.step_name.clone(),
            attempts: step.compensation_attempts,
            source,
        },
    }
}
