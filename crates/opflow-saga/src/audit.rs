use chrono::{DateTime, Utc};
use opflow_core::{SagaStepExecution, StepStatus};

/// Record of one step as seen by a poller.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub index: usize,
    pub status: StepStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub compensation_attempts: u32,
    pub max_compensation_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepRecord {
    /// A compensation that ran out of attempts and halted the rollback.
    #[must_use]
    pub fn compensation_stalled(&self) -> bool {
        self.status == StepStatus::Compensating
            && self.compensation_attempts >= self.max_compensation_attempts
    }

    fn symbol(&self) -> &'static str {
        match self.status {
            StepStatus::Pending => "·",
            StepStatus::Running => "▶",
            StepStatus::Completed => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Compensating if self.compensation_stalled() => "⚠",
            StepStatus::Compensating => "↺",
            StepStatus::Compensated => "↩",
            StepStatus::Skipped => "⤼",
        }
    }
}

/// Per-step view of a saga, built from its persisted step rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SagaAuditLog {
    records: Vec<StepRecord>,
}

impl SagaAuditLog {
    #[must_use]
    pub fn from_steps(steps: &[SagaStepExecution]) -> Self {
        let mut records: Vec<_> = steps
            .iter()
            .map(|step| StepRecord {
                name: step.step_name.clone(),
                index: step.step_index,
                status: step.status,
                attempts: step.attempt_count,
                max_attempts: step.max_attempts,
                compensation_attempts: step.compensation_attempts,
                max_compensation_attempts: step.max_compensation_attempts,
                started_at: step.started_at,
                completed_at: step.completed_at,
                error: step.error_message.clone(),
            })
            .collect();
        records.sort_by_key(|r| r.index);
        Self { records }
    }

    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// One line per step: status symbol, name, and attempt counters.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for record in &self.records {
            let mut line = format!("{} {}", record.symbol(), record.name);
            if record.attempts > 0 {
                line.push_str(&format!(
                    " ({}/{} attempts)",
                    record.attempts, record.max_attempts
                ));
            }
            if record.compensation_attempts > 0 {
                line.push_str(&format!(
                    " (compensation {}/{})",
                    record.compensation_attempts, record.max_compensation_attempts
                ));
            }
            if let Some(error) = &record.error {
                line.push_str(&format!(": {error}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}
