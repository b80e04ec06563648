//! Background worker pool for sagas and idempotent operations.
//!
//! The [`BackgroundOperationsManager`] owns a priority [`TaskQueue`] and a
//! bounded set of workers. Every task is run under a leased claim from the
//! [`ClaimTable`]: one key per saga, one per idempotency key. A worker that
//! dies stops renewing its lease, and the key becomes claimable again once
//! the lease expires.

mod claim;
mod error;
mod manager;
mod operations;
mod queue;
mod task;

pub use claim::{ClaimGuard, ClaimTable, Lease};
pub use error::{Result, WorkerError};
pub use manager::{BackgroundOperationsManager, Submission};
pub use operations::{OperationContext, OperationHandler, OperationRegistry};
pub use queue::TaskQueue;
pub use task::{Priority, Task, TaskKind};
