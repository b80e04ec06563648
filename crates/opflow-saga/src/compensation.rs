use std::sync::Arc;

use opflow_core::{Clock, SagaConfig, SagaExecution, SagaStepExecution, StepStatus};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::definition::StepDefinition;
use crate::error::{CompensationError, Result, ValidationError};
use crate::executor::bounded;
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::step::StepContext;
use crate::store::SagaStore;

/// Result of one compensation pass.
#[derive(Debug)]
pub enum CompensationOutcome {
    /// Every completed step was compensated; names in the order they ran.
    Completed { compensated: Vec<String> },
    /// A compensation used all of its attempts. Lower-index steps were left
    /// untouched.
    Halted {
        step: SagaStepExecution,
        error: CompensationError,
    },
}

/// Rolls back completed steps in strictly descending `step_index` order.
#[derive(Clone)]
pub struct CompensationCoordinator {
    store: Arc<dyn SagaStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    config: SagaConfig,
}

impl CompensationCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn SagaStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        config: SagaConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            retry,
            config,
        }
    }

    /// Compensate every `completed` (or partly compensated) step of `saga`,
    /// highest index first, passing each handler the output the step recorded.
    ///
    /// Already-compensated and skipped steps are passed over. A step whose
    /// compensation is exhausted halts the pass immediately without another
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if a step's handler is not registered or the saga
    /// ledger rejects an update.
    pub async fn compensate(
        &self,
        saga: &SagaExecution,
        steps: &[SagaStepExecution],
        plan: &[StepDefinition],
    ) -> Result<CompensationOutcome> {
        let mut pending: Vec<&SagaStepExecution> = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Compensating))
            .collect();
        pending.sort_by(|a, b| b.step_index.cmp(&a.step_index));

        let mut compensated = Vec::new();
        for step in pending {
            if let Some((row, error)) = self.compensate_step(saga, step, steps, plan).await? {
                return Ok(CompensationOutcome::Halted { step: row, error });
            }
            compensated.push(step.step_name.clone());
        }
        info!(saga_id = %saga.id, steps = compensated.len(), "compensation pass finished");
        Ok(CompensationOutcome::Completed { compensated })
    }

    async fn compensate_step(
        &self,
        saga: &SagaExecution,
        step: &SagaStepExecution,
        steps: &[SagaStepExecution],
        plan: &[StepDefinition],
    ) -> Result<Option<(SagaStepExecution, CompensationError)>> {
        let definition = plan.get(step.step_index);
        let handler_name = definition.map_or(step.step_name.as_str(), |d| d.handler.as_str());
        let handler = self.registry.get(handler_name).ok_or_else(|| {
            ValidationError::UnregisteredHandler {
                step: step.step_name.clone(),
                handler: handler_name.to_string(),
            }
        })?;
        let timeout = definition.map_or_else(
            || self.config.step_timeout(),
            |d| d.resolved_timeout(&self.config),
        );
        let description = handler.compensation_description();

        if step.status == StepStatus::Compensating && step.compensation_exhausted() {
            let error = CompensationError {
                step: step.step_name.clone(),
                description,
                attempt: step.compensation_attempts,
                error: step
                    .error_message
                    .clone()
                    .map_or_else(|| "compensation exhausted".into(), Into::into),
            };
            return Ok(Some((step.clone(), error)));
        }

        let prior_outputs: Map<String, Value> = steps
            .iter()
            .filter(|s| s.step_index < step.step_index)
            .filter_map(|s| Some((s.step_name.clone(), s.output_data.clone()?)))
            .collect();
        let output = step.output_data.clone().unwrap_or(Value::Null);
        let mut attempt = step.compensation_attempts;

        loop {
            attempt += 1;
            let now = self.clock.now();
            self.store.update_step(
                saga.id,
                step.step_index,
                &[StepStatus::Completed, StepStatus::Compensating],
                &mut |row| {
                    row.status = StepStatus::Compensating;
                    row.compensation_attempts = attempt;
                    row.updated_at = now;
                },
            )?;
            debug!(saga_id = %saga.id, step = %step.step_name, attempt, "compensating step");

            let ctx = StepContext {
                saga_id: saga.id,
                saga_name: saga.saga_name.clone(),
                tenant_id: saga.tenant_id.clone(),
                correlation_id: saga.correlation_id.clone(),
                step_name: step.step_name.clone(),
                step_index: step.step_index,
                attempt,
                saga_input: saga.input_data.clone(),
                prior_outputs: prior_outputs.clone(),
            };
            match bounded(timeout, handler.compensate(&ctx, output.clone())).await {
                Ok(data) => {
                    let now = self.clock.now();
                    self.store.update_step(
                        saga.id,
                        step.step_index,
                        &[StepStatus::Compensating],
                        &mut |row| {
                            row.status = StepStatus::Compensated;
                            row.compensation_data = data.clone();
                            row.error_message = None;
                            row.error_data = None;
                            row.updated_at = now;
                        },
                    )?;
                    info!(saga_id = %saga.id, step = %step.step_name, "{description}");
                    return Ok(None);
                }
                Err(error) => {
                    warn!(
                        saga_id = %saga.id,
                        step = %step.step_name,
                        attempt,
                        max_attempts = step.max_compensation_attempts,
                        cause = %error,
                        "compensation attempt failed"
                    );
                    let now = self.clock.now();
                    let row = self.store.update_step(
                        saga.id,
                        step.step_index,
                        &[StepStatus::Compensating],
                        &mut |row| {
                            row.error_message = Some(error.message.clone());
                            row.error_data =
                                Some(json!({"compensation": error.to_value(), "attempt": attempt}));
                            row.updated_at = now;
                        },
                    )?;
                    if attempt >= step.max_compensation_attempts {
                        let error = CompensationError {
                            step: step.step_name.clone(),
                            description,
                            attempt,
                            error,
                        };
                        return Ok(Some((row, error)));
                    }
                    tokio::time::sleep(self.retry.delay_after(attempt)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use opflow_core::{HandlerError, ManualClock, SagaStatus};

    use super::*;
    use crate::step::StepHandler;
    use crate::store::InMemorySagaStore;
    use crate::store::fixtures::{saga, steps};

    /// Records compensation order; every compensation fails when `failing` is set.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        failing: bool,
    }

    #[async_trait]
    impl StepHandler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(
            &self,
            _ctx: &StepContext,
            input: Value,
        ) -> std::result::Result<Value, HandlerError> {
            Ok(input)
        }

        async fn compensate(
            &self,
            _ctx: &StepContext,
            output: Value,
        ) -> std::result::Result<Option<Value>, HandlerError> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{}:{output}", self.name));
            if self.failing {
                return Err(HandlerError::new("still locked"));
            }
            Ok(Some(json!({"undone": self.name})))
        }
    }

    struct Fixture {
        coordinator: CompensationCoordinator,
        store: Arc<InMemorySagaStore>,
        saga: SagaExecution,
        plan: Vec<StepDefinition>,
        log: Arc<Mutex<Vec<String>>>,
    }

    /// Saga with steps a, b, c where a and b completed and c failed.
    fn fixture(failing: &[&'static str]) -> anyhow::Result<Fixture> {
        let names = ["a", "b", "c"];
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        for name in names {
            registry.register(Recorder {
                name,
                log: log.clone(),
                failing: failing.contains(&name),
            })?;
        }
        let store = Arc::new(InMemorySagaStore::new());
        let saga = saga("t1", 3);
        store.insert_saga(&saga, &steps(&saga, &names))?;
        for index in 0..2 {
            store.update_step(saga.id, index, &[StepStatus::Pending], &mut |row| {
                row.status = StepStatus::Running;
            })?;
            store.update_step(saga.id, index, &[StepStatus::Running], &mut |row| {
                row.status = StepStatus::Completed;
                row.output_data = Some(json!(index));
            })?;
        }
        store.update_step(saga.id, 2, &[StepStatus::Pending], &mut |row| {
            row.status = StepStatus::Running;
        })?;
        store.update_step(saga.id, 2, &[StepStatus::Running], &mut |row| {
            row.status = StepStatus::Failed;
        })?;
        let saga = store.update_saga(saga.id, &[SagaStatus::Pending], &mut |s| {
            s.status = SagaStatus::Running;
            s.current_step_index = 2;
        })?;

        let coordinator = CompensationCoordinator::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(ManualClock::fixed()),
            RetryPolicy::immediate(),
            SagaConfig::default(),
        );
        let plan = names.iter().map(|n| StepDefinition::new(*n)).collect();
        Ok(Fixture {
            coordinator,
            store,
            saga,
            plan,
            log,
        })
    }

    #[tokio::test]
    async fn compensates_completed_steps_in_reverse_order() -> anyhow::Result<()> {
        let f = fixture(&[])?;
        let steps = f.store.get_steps(f.saga.id)?;

        let outcome = f.coordinator.compensate(&f.saga, &steps, &f.plan).await?;
        let rows = f.store.get_steps(f.saga.id)?;

        assert!(matches!(
            outcome,
            CompensationOutcome::Completed { ref compensated } if compensated == &["b", "a"]
        ));
        assert_eq!(*f.log.lock().expect("log lock"), ["b:1", "a:0"]);
        assert_eq!(rows[0].status, StepStatus::Compensated);
        assert_eq!(rows[0].compensation_data, Some(json!({"undone": "a"})));
        assert_eq!(rows[2].status, StepStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_compensation_halts_before_earlier_steps() -> anyhow::Result<()> {
        let f = fixture(&["b"])?;
        let steps = f.store.get_steps(f.saga.id)?;

        let outcome = f.coordinator.compensate(&f.saga, &steps, &f.plan).await?;
        let rows = f.store.get_steps(f.saga.id)?;

        assert!(matches!(
            outcome,
            CompensationOutcome::Halted { ref step, ref error }
                if step.step_name == "b" && error.attempt == 3
        ));
        assert_eq!(*f.log.lock().expect("log lock"), ["b:1", "b:1", "b:1"]);
        assert_eq!(rows[0].status, StepStatus::Completed);
        assert_eq!(rows[1].status, StepStatus::Compensating);
        assert_eq!(rows[1].compensation_attempts, 3);
        Ok(())
    }

    #[tokio::test]
    async fn stalled_step_is_not_retried_on_next_pass() -> anyhow::Result<()> {
        let f = fixture(&["b"])?;
        let steps = f.store.get_steps(f.saga.id)?;
        f.coordinator.compensate(&f.saga, &steps, &f.plan).await?;

        let steps = f.store.get_steps(f.saga.id)?;
        let outcome = f.coordinator.compensate(&f.saga, &steps, &f.plan).await?;

        assert!(matches!(outcome, CompensationOutcome::Halted { .. }));
        assert_eq!(f.log.lock().expect("log lock").len(), 3);
        Ok(())
    }
}
