use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::ids::{OperationId, SagaId, StepExecutionId};

/// Opaque structured data carried by sagas, steps and operations.
pub type Payload = Value;

macro_rules! status_names {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(CoreError::UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

status_names!(SagaStatus, "saga", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Compensating => "compensating",
    Compensated => "compensated",
});

impl SagaStatus {
    /// Terminal records are immutable.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed)
                | (Self::Failed, Self::Compensating)
                | (Self::Compensating, Self::Compensated)
        )
    }

    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTransition`] if the machine forbids the move.
    pub fn check_transition(self, next: Self) -> Result<(), CoreError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                entity: "saga",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Skipped,
}

status_names!(StepStatus, "step", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Compensating => "compensating",
    Compensated => "compensated",
    Skipped => "skipped",
});

impl StepStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Compensated | Self::Skipped)
    }

    /// Whether a later step may run after a step in this state.
    #[must_use]
    pub const fn unblocks_successor(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Completed | Self::Failed)
                | (Self::Completed, Self::Compensating)
                | (Self::Compensating, Self::Compensated)
        )
    }

    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTransition`] if the machine forbids the move.
    pub fn check_transition(self, next: Self) -> Result<(), CoreError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                entity: "step",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

status_names!(OperationStatus, "operation", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl OperationStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Completed | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }

    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTransition`] if the machine forbids the move.
    pub fn check_transition(self, next: Self) -> Result<(), CoreError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                entity: "operation",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// One row of `saga_executions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    pub id: SagaId,
    pub saga_name: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub status: SagaStatus,
    pub current_step: Option<String>,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub input_data: Payload,
    pub output_data: Option<Payload>,
    pub error_data: Option<Payload>,
    pub context_data: Payload,
    pub metadata: Payload,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of `saga_step_executions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepExecution {
    pub id: StepExecutionId,
    pub saga_id: SagaId,
    pub step_name: String,
    pub step_index: usize,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub input_data: Option<Payload>,
    pub output_data: Option<Payload>,
    pub error_message: Option<String>,
    pub error_data: Option<Payload>,
    pub compensation_data: Option<Payload>,
    pub compensation_attempts: u32,
    pub max_compensation_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaStepExecution {
    #[must_use]
    pub fn compensation_exhausted(&self) -> bool {
        self.compensation_attempts >= self.max_compensation_attempts
    }
}

/// One row of `idempotent_operations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotentOperation {
    pub id: OperationId,
    pub idempotency_key: String,
    pub operation_type: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub status: OperationStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub input_data: Payload,
    pub output_data: Option<Payload>,
    pub error_message: Option<String>,
    pub error_data: Option<Payload>,
    pub execution_time_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub metadata: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotentOperation {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_happy_path_transitions_are_allowed() {
        assert!(SagaStatus::Pending.can_transition_to(SagaStatus::Running));
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Completed));
    }

    #[test]
    fn saga_failure_path_transitions_are_allowed() {
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Failed));
        assert!(SagaStatus::Failed.can_transition_to(SagaStatus::Compensating));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Compensated));
    }

    #[test]
    fn terminal_sagas_cannot_move() {
        for next in [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Failed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
        ] {
            assert!(!SagaStatus::Completed.can_transition_to(next));
            assert!(!SagaStatus::Compensated.can_transition_to(next));
        }
    }

    #[test]
    fn failed_saga_must_compensate_before_finishing() {
        let err = SagaStatus::Failed
            .check_transition(SagaStatus::Compensated)
            .expect_err("should be rejected");

        assert!(err.to_string().contains("failed -> compensated"));
    }

    #[test]
    fn only_pending_steps_can_be_skipped() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Running.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Skipped));
    }

    #[test]
    fn only_completed_steps_can_be_compensated() {
        assert!(StepStatus::Completed.can_transition_to(StepStatus::Compensating));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Compensating));
        assert!(!StepStatus::Skipped.can_transition_to(StepStatus::Compensating));
    }

    #[test]
    fn operations_are_final_once_completed_or_failed() {
        assert!(!OperationStatus::Completed.can_transition_to(OperationStatus::Failed));
        assert!(!OperationStatus::Failed.can_transition_to(OperationStatus::Completed));
        assert!(OperationStatus::Running.can_transition_to(OperationStatus::Running));
    }

    #[test]
    fn status_strings_round_trip() -> anyhow::Result<()> {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Compensating,
            StepStatus::Compensated,
            StepStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<StepStatus>()?, status);
        }
        Ok(())
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!("paused".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case_names() -> anyhow::Result<()> {
        let json = serde_json::to_string(&SagaStatus::Compensating)?;
        assert_eq!(json, "\"compensating\"");
        Ok(())
    }
}
