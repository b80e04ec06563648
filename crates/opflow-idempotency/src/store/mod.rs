mod memory;
mod sqlite;

use chrono::{DateTime, Utc};
use opflow_core::{IdempotentOperation, OperationStatus};

use crate::Result;

pub use memory::InMemoryIdempotencyStore;
pub use sqlite::SqliteIdempotencyStore;

/// Result of an atomic create-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    /// The record now stored under the key: ours if `created`, otherwise the
    /// first writer's.
    pub record: IdempotentOperation,
    pub created: bool,
}

/// Result of a compare-and-set on a record's status.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(IdempotentOperation),
    /// The record exists but its status was not one of the expected ones;
    /// it was left untouched.
    Rejected(IdempotentOperation),
    Missing,
}

/// Durable storage behind the idempotency ledger.
///
/// Every method is a short atomic critical section. Implementations must
/// guarantee that concurrent `insert_if_absent` calls for one key leave
/// exactly one record.
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` unless a live record already holds its key.
    ///
    /// A record under the same key whose `expires_at <= now` is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn insert_if_absent(
        &self,
        record: IdempotentOperation,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome>;

    /// Fetch a record regardless of expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn get(&self, key: &str) -> Result<Option<IdempotentOperation>>;

    /// Apply `update` to the record if its status is one of `expected`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn transition(
        &self,
        key: &str,
        expected: &[OperationStatus],
        update: &mut dyn FnMut(&mut IdempotentOperation),
    ) -> Result<Transition>;

    /// Delete every record with `expires_at <= now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Live records whose status is one of `statuses`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn list_by_status(
        &self,
        statuses: &[OperationStatus],
        now: DateTime<Utc>,
    ) -> Result<Vec<IdempotentOperation>>;
}
