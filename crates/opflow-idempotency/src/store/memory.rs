use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use opflow_core::{IdempotentOperation, OperationStatus};

use super::{IdempotencyStore, InsertOutcome, Transition};
use crate::Result;

/// Process-local store with the same semantics as the SQLite store.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotentOperation>>,
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn insert_if_absent(
        &self,
        record: IdempotentOperation,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = records.get(&record.idempotency_key) {
            if !existing.is_expired_at(now) {
                return Ok(InsertOutcome {
                    record: existing.clone(),
                    created: false,
                });
            }
        }

        records.insert(record.idempotency_key.clone(), record.clone());
        Ok(InsertOutcome {
            record,
            created: true,
        })
    }

    fn get(&self, key: &str) -> Result<Option<IdempotentOperation>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn transition(
        &self,
        key: &str,
        expected: &[OperationStatus],
        update: &mut dyn FnMut(&mut IdempotentOperation),
    ) -> Result<Transition> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = records.get_mut(key) else {
            return Ok(Transition::Missing);
        };
        if !expected.contains(&record.status) {
            return Ok(Transition::Rejected(record.clone()));
        }
        update(record);
        Ok(Transition::Applied(record.clone()))
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok(before - records.len())
    }

    fn list_by_status(
        &self,
        statuses: &[OperationStatus],
        now: DateTime<Utc>,
    ) -> Result<Vec<IdempotentOperation>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| statuses.contains(&r.status) && !r.is_expired_at(now))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }
}
