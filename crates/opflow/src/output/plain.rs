use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use opflow_core::{IdempotentOperation, SagaExecution};
use opflow_saga::SagaAuditLog;
use serde_json::Value;

pub(crate) struct PlainTextFormatter;

impl PlainTextFormatter {
    pub(crate) fn saga_detail(saga: &SagaExecution, audit: &SagaAuditLog) -> String {
        let mut output = format!("saga {} ({})\n", saga.id, saga.saga_name);
        field(&mut output, "tenant", &saga.tenant_id);
        field(&mut output, "status", saga.status);
        field(&mut output, "correlation", &saga.correlation_id);
        field(&mut output, "progress", progress(saga));
        field(&mut output, "created", timestamp(saga.created_at));
        if let Some(started) = saga.started_at {
            field(&mut output, "started", timestamp(started));
        }
        if let Some(completed) = saga.completed_at {
            field(&mut output, "completed", timestamp(completed));
        }
        if let Some(error) = &saga.error_data {
            if let Some(message) = error.get("message").and_then(Value::as_str) {
                field(&mut output, "error", message);
            }
            if let Some(cause) = error.get("cause").and_then(Value::as_str) {
                field(&mut output, "cause", cause);
            }
            if let Some(alert) = error
                .get("alert")
                .and_then(|alert| alert.get("message"))
                .and_then(Value::as_str)
            {
                field(&mut output, "alert", alert);
            }
        }

        output.push_str("\nsteps:\n");
        for line in audit.summary().lines() {
            let _ = writeln!(output, "  {line}");
        }
        output
    }

    pub(crate) fn saga_row(saga: &SagaExecution) -> String {
        format!(
            "{}  {:<12}  {:<16}  {}  {}  {}",
            saga.id,
            saga.status,
            saga.tenant_id,
            saga.saga_name,
            progress(saga),
            timestamp(saga.created_at)
        )
    }

    pub(crate) fn operation_detail(record: &IdempotentOperation) -> String {
        let mut output = String::new();
        field(&mut output, "key", &record.idempotency_key);
        field(&mut output, "operation", &record.operation_type);
        field(&mut output, "tenant", &record.tenant_id);
        if let Some(user) = &record.user_id {
            field(&mut output, "user", user);
        }
        field(&mut output, "status", record.status);
        field(
            &mut output,
            "attempts",
            format!("{}/{}", record.attempt_count, record.max_attempts),
        );
        field(&mut output, "created", timestamp(record.created_at));
        field(&mut output, "expires", timestamp(record.expires_at));
        if let Some(ms) = record.execution_time_ms {
            field(&mut output, "execution", format!("{ms}ms"));
        }
        if let Some(result) = &record.output_data {
            field(&mut output, "output", result);
        }
        if let Some(error) = &record.error_message {
            field(&mut output, "error", error);
        }
        output
    }
}

fn field(output: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "  {:<12} {value}", format!("{name}:"));
}

fn progress(saga: &SagaExecution) -> String {
    match &saga.current_step {
        Some(step) => format!("{}/{} {step}", saga.current_step_index, saga.total_steps),
        None => format!("{}/{}", saga.current_step_index, saga.total_steps),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
