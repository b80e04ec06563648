use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use opflow_core::{SagaExecution, SagaId, SagaStatus, SagaStepExecution, StepStatus};

use super::{
    Result, SagaFilter, SagaStore, check_saga_update, check_step_update, guard_saga, guard_step,
};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct State {
    sagas: HashMap<SagaId, SagaExecution>,
    steps: HashMap<SagaId, Vec<SagaStepExecution>>,
}

/// Process-local saga ledger with the same semantics as the SQLite store.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    state: Mutex<State>,
}

impl InMemorySagaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SagaStore for InMemorySagaStore {
    fn insert_saga(&self, saga: &SagaExecution, steps: &[SagaStepExecution]) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sagas.contains_key(&saga.id) {
            return Err(StoreError::DuplicateSaga { saga_id: saga.id });
        }
        let mut steps = steps.to_vec();
        steps.sort_by_key(|s| s.step_index);
        state.sagas.insert(saga.id, saga.clone());
        state.steps.insert(saga.id, steps);
        Ok(())
    }

    fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.sagas.get(&saga_id).cloned())
    }

    fn get_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepExecution>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.steps.get(&saga_id).cloned().unwrap_or_default())
    }

    fn update_saga(
        &self,
        saga_id: SagaId,
        expected: &[SagaStatus],
        update: &mut dyn FnMut(&mut SagaExecution),
    ) -> Result<SagaExecution> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = state
            .sagas
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound { saga_id })?;
        guard_saga(current, expected)?;

        let mut next = current.clone();
        update(&mut next);
        check_saga_update(current, &next)?;
        *current = next.clone();
        Ok(next)
    }

    fn update_step(
        &self,
        saga_id: SagaId,
        index: usize,
        expected: &[StepStatus],
        update: &mut dyn FnMut(&mut SagaStepExecution),
    ) -> Result<SagaStepExecution> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let saga = state
            .sagas
            .get(&saga_id)
            .ok_or(StoreError::SagaNotFound { saga_id })?;
        if saga.status.is_terminal() {
            return Err(StoreError::Terminal {
                saga_id,
                status: saga.status,
            });
        }

        let steps = state
            .steps
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound { saga_id })?;
        let position = steps
            .iter()
            .position(|s| s.step_index == index)
            .ok_or(StoreError::StepNotFound { saga_id, index })?;
        guard_step(&steps[position], expected)?;

        let mut next = steps[position].clone();
        update(&mut next);
        check_step_update(&steps[position], &next, steps)?;
        steps[position] = next.clone();
        Ok(next)
    }

    fn list_sagas(&self, filter: &SagaFilter) -> Result<Vec<SagaExecution>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut sagas: Vec<_> = state
            .sagas
            .values()
            .filter(|saga| filter.matches(saga))
            .cloned()
            .collect();
        sagas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            sagas.truncate(limit);
        }
        Ok(sagas)
    }
}
