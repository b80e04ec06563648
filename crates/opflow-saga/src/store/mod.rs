mod memory;
mod sqlite;

use opflow_core::{SagaExecution, SagaId, SagaStatus, SagaStepExecution, StepStatus};

use crate::error::StoreError;

pub use memory::InMemorySagaStore;
pub use sqlite::SqliteSagaStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Selects sagas for [`SagaStore::list_sagas`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SagaFilter {
    pub tenant_id: Option<String>,
    pub status: Option<SagaStatus>,
    pub limit: Option<usize>,
}

impl SagaFilter {
    #[must_use]
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: SagaStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, saga: &SagaExecution) -> bool {
        self.tenant_id
            .as_deref()
            .is_none_or(|tenant| saga.tenant_id == tenant)
            && self.status.is_none_or(|status| saga.status == status)
    }
}

/// Durable saga and step state.
///
/// Updates are compare-and-set: the closure runs only when the current
/// status is one of `expected`, and the store validates the result against
/// the status machines before persisting it. Completed and compensated sagas
/// (and their steps) are immutable. A step may only become `running` when
/// every lower-index step is `completed` or `skipped`.
pub trait SagaStore: Send + Sync {
    /// Persist a new saga together with all of its step rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the saga id is taken or storage fails.
    fn insert_saga(&self, saga: &SagaExecution, steps: &[SagaStepExecution]) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaExecution>>;

    /// Step rows ordered by `step_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn get_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepExecution>>;

    /// # Errors
    ///
    /// Returns [`StoreError::SagaConflict`] when the status is not one of
    /// `expected`, [`StoreError::Terminal`] for an immutable saga, or a
    /// transition error if `update` breaks the status machine.
    fn update_saga(
        &self,
        saga_id: SagaId,
        expected: &[SagaStatus],
        update: &mut dyn FnMut(&mut SagaExecution),
    ) -> Result<SagaExecution>;

    /// # Errors
    ///
    /// Returns [`StoreError::StepConflict`] when the status is not one of
    /// `expected`, [`StoreError::OutOfOrder`] when a step would run ahead of
    /// its predecessor, or a transition error if `update` breaks the status
    /// machine.
    fn update_step(
        &self,
        saga_id: SagaId,
        index: usize,
        expected: &[StepStatus],
        update: &mut dyn FnMut(&mut SagaStepExecution),
    ) -> Result<SagaStepExecution>;

    /// Sagas matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn list_sagas(&self, filter: &SagaFilter) -> Result<Vec<SagaExecution>>;
}

fn guard_saga(saga: &SagaExecution, expected: &[SagaStatus]) -> Result<()> {
    if saga.status.is_terminal() {
        return Err(StoreError::Terminal {
            saga_id: saga.id,
            status: saga.status,
        });
    }
    if !expected.contains(&saga.status) {
        return Err(StoreError::SagaConflict {
            saga_id: saga.id,
            expected: expected.to_vec(),
            actual: saga.status,
        });
    }
    Ok(())
}

fn check_saga_update(before: &SagaExecution, after: &SagaExecution) -> Result<()> {
    before.status.check_transition(after.status)?;
    if after.current_step_index > after.total_steps {
        return Err(StoreError::IndexOutOfRange {
            saga_id: after.id,
            index: after.current_step_index,
            total: after.total_steps,
        });
    }
    Ok(())
}

fn guard_step(step: &SagaStepExecution, expected: &[StepStatus]) -> Result<()> {
    if !expected.contains(&step.status) {
        return Err(StoreError::StepConflict {
            saga_id: step.saga_id,
            index: step.step_index,
            expected: expected.to_vec(),
            actual: step.status,
        });
    }
    Ok(())
}

fn check_step_update(
    before: &SagaStepExecution,
    after: &SagaStepExecution,
    siblings: &[SagaStepExecution],
) -> Result<()> {
    before.status.check_transition(after.status)?;
    if after.status == StepStatus::Running && before.status != StepStatus::Running {
        if let Some(blocking) = siblings
            .iter()
            .find(|s| s.step_index < after.step_index && !s.status.unblocks_successor())
        {
            return Err(StoreError::OutOfOrder {
                saga_id: after.saga_id,
                index: after.step_index,
                blocking: blocking.step_index,
            });
        }
    }
    Ok(())
}


/// Behaviour every [`SagaStore`] must share, run against each implementation.
#[cfg(test)]
pub(crate) mod contract {
    use opflow_core::{SagaStatus, StepStatus};
    use serde_json::json;

    use super::fixtures::{saga, steps};
    use super::{SagaFilter, SagaStore};
    use crate::error::StoreError;

    pub(crate) fn round_trips_saga_and_steps(store: &dyn SagaStore) -> anyhow::Result<()> {
        let saga = saga("t1", 2);
        let rows = steps(&saga, &["create_db", "create_admin"]);
        store.insert_saga(&saga, &rows)?;

        assert_eq!(store.get_saga(saga.id)?, Some(saga.clone()));
        assert_eq!(store.get_steps(saga.id)?, rows);
        Ok(())
    }

    pub(crate) fn rejects_out_of_order_step(store: &dyn SagaStore) -> anyhow::Result<()> {
        let saga = saga("t1", 2);
        store.insert_saga(&saga, &steps(&saga, &["a", "b"]))?;

        let result = store.update_step(saga.id, 1, &[StepStatus::Pending], &mut |s| {
            s.status = StepStatus::Running;
        });

        assert!(matches!(
            result,
            Err(StoreError::OutOfOrder {
                index: 1,
                blocking: 0,
                ..
            })
        ));
        Ok(())
    }

    pub(crate) fn allows_step_after_skipped_predecessor(
        store: &dyn SagaStore,
    ) -> anyhow::Result<()> {
        let saga = saga("t1", 2);
        store.insert_saga(&saga, &steps(&saga, &["a", "b"]))?;

        store.update_step(saga.id, 0, &[StepStatus::Pending], &mut |s| {
            s.status = StepStatus::Skipped;
        })?;
        let running = store.update_step(saga.id, 1, &[StepStatus::Pending], &mut |s| {
            s.status = StepStatus::Running;
        })?;

        assert_eq!(running.status, StepStatus::Running);
        Ok(())
    }

    pub(crate) fn terminal_saga_is_immutable(store: &dyn SagaStore) -> anyhow::Result<()> {
        let saga = saga("t1", 1);
        store.insert_saga(&saga, &steps(&saga, &["a"]))?;
        store.update_saga(saga.id, &[SagaStatus::Pending], &mut |s| {
            s.status = SagaStatus::Running;
        })?;
        store.update_saga(saga.id, &[SagaStatus::Running], &mut |s| {
            s.status = SagaStatus::Completed;
            s.current_step_index = 1;
        })?;

        let result = store.update_saga(saga.id, &[SagaStatus::Completed], &mut |s| {
            s.metadata = json!({"tampered": true});
        });

        assert!(matches!(
            result,
            Err(StoreError::Terminal {
                status: SagaStatus::Completed,
                ..
            })
        ));
        Ok(())
    }

    pub(crate) fn rejects_invalid_transition(store: &dyn SagaStore) -> anyhow::Result<()> {
        let saga = saga("t1", 1);
        store.insert_saga(&saga, &steps(&saga, &["a"]))?;

        let result = store.update_saga(saga.id, &[SagaStatus::Pending], &mut |s| {
            s.status = SagaStatus::Compensated;
        });

        assert!(matches!(result, Err(StoreError::Core(_))));
        assert_eq!(
            store.get_saga(saga.id)?.map(|s| s.status),
            Some(SagaStatus::Pending)
        );
        Ok(())
    }

    pub(crate) fn compare_and_set_detects_conflict(store: &dyn SagaStore) -> anyhow::Result<()> {
        let saga = saga("t1", 1);
        store.insert_saga(&saga, &steps(&saga, &["a"]))?;

        let result = store.update_saga(saga.id, &[SagaStatus::Running], &mut |s| {
            s.current_step_index = 1;
        });

        assert!(matches!(
            result,
            Err(StoreError::SagaConflict {
                actual: SagaStatus::Pending,
                ..
            })
        ));
        Ok(())
    }

    pub(crate) fn filters_by_tenant_and_status(store: &dyn SagaStore) -> anyhow::Result<()> {
        let a = saga("t1", 1);
        let b = saga("t2", 1);
        store.insert_saga(&a, &steps(&a, &["x"]))?;
        store.insert_saga(&b, &steps(&b, &["x"]))?;
        store.update_saga(b.id, &[SagaStatus::Pending], &mut |s| {
            s.status = SagaStatus::Running;
        })?;

        let t1 = store.list_sagas(&SagaFilter::default().tenant("t1"))?;
        let running = store.list_sagas(&SagaFilter::default().status(SagaStatus::Running))?;
        let all = store.list_sagas(&SagaFilter::default().limit(1))?;

        assert_eq!(t1.iter().map(|s| s.id).collect::<Vec<_>>(), [a.id]);
        assert_eq!(running.iter().map(|s| s.id).collect::<Vec<_>>(), [b.id]);
        assert_eq!(all.len(), 1);
        Ok(())
    }

    pub(crate) fn duplicate_insert_is_rejected(store: &dyn SagaStore) -> anyhow::Result<()> {
        let saga = saga("t1", 1);
        store.insert_saga(&saga, &steps(&saga, &["a"]))?;

        let result = store.insert_saga(&saga, &steps(&saga, &["a"]));

        assert!(matches!(result, Err(StoreError::DuplicateSaga { .. })));
        Ok(())
    }
}
