//! Durable sagas for multi-step operations.
//!
//! A saga is an ordered list of steps, each backed by a registered
//! [`StepHandler`]. The [`SagaEngine`] runs steps strictly in order with
//! bounded retries, persisting every transition to a [`SagaStore`]. When a
//! step exhausts its attempts, the completed steps are compensated in
//! reverse order. A compensation that exhausts its own attempts leaves the
//! saga `compensating` and raises an [`OperatorAlert`].

mod alert;
mod audit;
mod builder;
mod compensation;
mod definition;
mod engine;
mod error;
mod executor;
mod registry;
mod retry;
mod step;
pub mod store;

pub use alert::{AlertSink, OperatorAlert, RecordingAlertSink, TracingAlertSink};
pub use audit::{SagaAuditLog, StepRecord};
pub use builder::{Empty, HasSteps, SagaBuilder};
pub use compensation::{CompensationCoordinator, CompensationOutcome};
pub use definition::{SagaDefinition, StepDefinition};
pub use engine::{SagaEngine, SagaProgress, SagaStart};
pub use error::{CompensationError, Result, SagaError, StoreError, ValidationError};
pub use executor::{StepExecutor, StepOutcome, StepRequest};
pub use registry::HandlerRegistry;
pub use retry::RetryPolicy;
pub use step::{StepContext, StepHandler};
pub use store::{InMemorySagaStore, SagaFilter, SagaStore, SqliteSagaStore};
