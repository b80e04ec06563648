use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use opflow_core::SagaId;
use serde::{Deserialize, Serialize};
use tracing::error;

/// A rollback that stopped because a compensation ran out of attempts.
///
/// The saga stays `compensating` until an operator intervenes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub saga_id: SagaId,
    pub saga_name: String,
    pub tenant_id: String,
    pub step: String,
    pub step_index: usize,
    pub attempts: u32,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Destination for operator alerts.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &OperatorAlert);
}

/// Logs alerts at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: &OperatorAlert) {
        error!(
            saga_id = %alert.saga_id,
            saga = %alert.saga_name,
            tenant = %alert.tenant_id,
            step = %alert.step,
            attempts = alert.attempts,
            "compensation exhausted, operator action required: {}",
            alert.message
        );
    }
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingAlertSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: &OperatorAlert) {
        TracingAlertSink.raise(alert);
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
    }
}
