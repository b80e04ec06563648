//! Core types shared by the opflow ledgers, saga engine and worker pool.
//!
//! The records in [`types`] mirror the persisted schema one-to-one. Status
//! enums own their transition tables so every store enforces the same
//! state machines.

pub mod clock;
pub mod config;
pub mod error;
mod handler;
pub mod ids;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    IdempotencyConfig, MIN_LEASE_TIMEOUT_MS, OpflowConfig, RetryConfig, SagaConfig, WorkerConfig,
};
pub use error::{CoreError, Result};
pub use handler::HandlerError;
pub use ids::{OperationId, SagaId, StepExecutionId, TaskId};
pub use types::*;
