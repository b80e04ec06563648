use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use opflow_core::clock::{from_millis, to_millis};
use opflow_core::{
    SagaExecution, SagaId, SagaStatus, SagaStepExecution, StepExecutionId, StepStatus,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params, params_from_iter,
};
use serde_json::Value;

use super::{
    Result, SagaFilter, SagaStore, check_saga_update, check_step_update, guard_saga, guard_step,
};
use crate::error::StoreError;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS saga_executions (
    id TEXT PRIMARY KEY,
    saga_name TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    status TEXT NOT NULL,
    current_step TEXT,
    current_step_index INTEGER NOT NULL DEFAULT 0,
    total_steps INTEGER NOT NULL,
    input_data TEXT NOT NULL,
    output_data TEXT,
    error_data TEXT,
    context_data TEXT NOT NULL,
    metadata TEXT NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_saga_executions_tenant_status
    ON saga_executions(tenant_id, status);
CREATE INDEX IF NOT EXISTS idx_saga_executions_correlation_id
    ON saga_executions(correlation_id);
CREATE TABLE IF NOT EXISTS saga_step_executions (
    id TEXT PRIMARY KEY,
    saga_id TEXT NOT NULL REFERENCES saga_executions(id) ON DELETE CASCADE,
    step_name TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    input_data TEXT,
    output_data TEXT,
    error_message TEXT,
    error_data TEXT,
    compensation_data TEXT,
    compensation_attempts INTEGER NOT NULL DEFAULT 0,
    max_compensation_attempts INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (saga_id, step_index)
);
CREATE INDEX IF NOT EXISTS idx_saga_step_executions_saga_step
    ON saga_step_executions(saga_id, step_index);
CREATE INDEX IF NOT EXISTS idx_saga_step_executions_status
    ON saga_step_executions(status);
";

const SAGA_COLUMNS: &str = "id, saga_name, tenant_id, correlation_id, status, current_step, \
     current_step_index, total_steps, input_data, output_data, error_data, context_data, \
     metadata, started_at, completed_at, created_at, updated_at";

const STEP_COLUMNS: &str = "id, saga_id, step_name, step_index, status, attempt_count, \
     max_attempts, input_data, output_data, error_message, error_data, compensation_data, \
     compensation_attempts, max_compensation_attempts, started_at, completed_at, created_at, \
     updated_at";

/// Saga ledger persisted in the `saga_executions` and
/// `saga_step_executions` tables.
#[derive(Debug, Clone)]
pub struct SqliteSagaStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSagaStore {
    /// Open (or create) a database file and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Arc::new(Mutex::new(Connection::open_in_memory()?)))
    }

    /// Share an existing connection, e.g. with the idempotency store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        conn.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl SagaStore for SqliteSagaStore {
    fn insert_saga(&self, saga: &SagaExecution, steps: &[SagaStepExecution]) -> Result<()> {
        self.with_tx(|tx| {
            if select_saga(tx, saga.id)?.is_some() {
                return Err(StoreError::DuplicateSaga { saga_id: saga.id });
            }
            tx.execute(
                &format!(
                    "INSERT INTO saga_executions ({SAGA_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    saga.id.to_string(),
                    saga.saga_name,
                    saga.tenant_id,
                    saga.correlation_id,
                    saga.status.as_str(),
                    saga.current_step,
                    to_i64(saga.current_step_index),
                    to_i64(saga.total_steps),
                    encode(&saga.input_data)?,
                    encode_opt(saga.output_data.as_ref())?,
                    encode_opt(saga.error_data.as_ref())?,
                    encode(&saga.context_data)?,
                    encode(&saga.metadata)?,
                    saga.started_at.map(to_millis),
                    saga.completed_at.map(to_millis),
                    to_millis(saga.created_at),
                    to_millis(saga.updated_at),
                ],
            )?;
            for step in steps {
                tx.execute(
                    &format!(
                        "INSERT INTO saga_step_executions ({STEP_COLUMNS}) VALUES \
                         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                    ),
                    params![
                        step.id.to_string(),
                        step.saga_id.to_string(),
                        step.step_name,
                        to_i64(step.step_index),
                        step.status.as_str(),
                        step.attempt_count,
                        step.max_attempts,
                        encode_opt(step.input_data.as_ref())?,
                        encode_opt(step.output_data.as_ref())?,
                        step.error_message,
                        encode_opt(step.error_data.as_ref())?,
                        encode_opt(step.compensation_data.as_ref())?,
                        step.compensation_attempts,
                        step.max_compensation_attempts,
                        step.started_at.map(to_millis),
                        step.completed_at.map(to_millis),
                        to_millis(step.created_at),
                        to_millis(step.updated_at),
                    ],
                )?;
            }
            Ok(())
        })
    }

    fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        select_saga(&conn, saga_id)
    }

    fn get_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepExecution>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        select_steps(&conn, saga_id)
    }

    fn update_saga(
        &self,
        saga_id: SagaId,
        expected: &[SagaStatus],
        update: &mut dyn FnMut(&mut SagaExecution),
    ) -> Result<SagaExecution> {
        self.with_tx(|tx| {
            let current = select_saga(tx, saga_id)?.ok_or(StoreError::SagaNotFound { saga_id })?;
            guard_saga(&current, expected)?;

            let mut next = current.clone();
            update(&mut next);
            check_saga_update(&current, &next)?;
            tx.execute(
                "UPDATE saga_executions SET status = ?2, current_step = ?3, \
                 current_step_index = ?4, output_data = ?5, error_data = ?6, context_data = ?7, \
                 metadata = ?8, started_at = ?9, completed_at = ?10, updated_at = ?11 \
                 WHERE id = ?1",
                params![
                    saga_id.to_string(),
                    next.status.as_str(),
                    next.current_step,
                    to_i64(next.current_step_index),
                    encode_opt(next.output_data.as_ref())?,
                    encode_opt(next.error_data.as_ref())?,
                    encode(&next.context_data)?,
                    encode(&next.metadata)?,
                    next.started_at.map(to_millis),
                    next.completed_at.map(to_millis),
                    to_millis(next.updated_at),
                ],
            )?;
            Ok(next)
        })
    }

    fn update_step(
        &self,
        saga_id: SagaId,
        index: usize,
        expected: &[StepStatus],
        update: &mut dyn FnMut(&mut SagaStepExecution),
    ) -> Result<SagaStepExecution> {
        self.with_tx(|tx| {
            let saga = select_saga(tx, saga_id)?.ok_or(StoreError::SagaNotFound { saga_id })?;
            if saga.status.is_terminal() {
                return Err(StoreError::Terminal {
                    saga_id,
                    status: saga.status,
                });
            }
            let steps = select_steps(tx, saga_id)?;
            let current = steps
                .iter()
                .find(|s| s.step_index == index)
                .ok_or(StoreError::StepNotFound { saga_id, index })?;
            guard_step(current, expected)?;

            let mut next = current.clone();
            update(&mut next);
            check_step_update(current, &next, &steps)?;
            tx.execute(
                "UPDATE saga_step_executions SET status = ?3, attempt_count = ?4, \
                 input_data = ?5, output_data = ?6, error_message = ?7, error_data = ?8, \
                 compensation_data = ?9, compensation_attempts = ?10, started_at = ?11, \
                 completed_at = ?12, updated_at = ?13 \
                 WHERE saga_id = ?1 AND step_index = ?2",
                params![
                    saga_id.to_string(),
                    to_i64(index),
                    next.status.as_str(),
                    next.attempt_count,
                    encode_opt(next.input_data.as_ref())?,
                    encode_opt(next.output_data.as_ref())?,
                    next.error_message,
                    encode_opt(next.error_data.as_ref())?,
                    encode_opt(next.compensation_data.as_ref())?,
                    next.compensation_attempts,
                    next.started_at.map(to_millis),
                    next.completed_at.map(to_millis),
                    to_millis(next.updated_at),
                ],
            )?;
            Ok(next)
        })
    }

    fn list_sagas(&self, filter: &SagaFilter) -> Result<Vec<SagaExecution>> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        if let Some(tenant) = &filter.tenant_id {
            conditions.push("tenant_id = ?");
            values.push(SqlValue::Text(tenant.clone()));
        }
        if let Some(status) = filter.status {
            conditions.push("status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        let mut sql = format!("SELECT {SAGA_COLUMNS} FROM saga_executions");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(to_i64(limit)));
        }

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_from_iter(values), RawSaga::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawSaga::into_record).collect()
    }
}

fn select_saga(conn: &Connection, saga_id: SagaId) -> Result<Option<SagaExecution>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SAGA_COLUMNS} FROM saga_executions WHERE id = ?1"),
            params![saga_id.to_string()],
            RawSaga::from_row,
        )
        .optional()?;
    raw.map(RawSaga::into_record).transpose()
}

fn select_steps(conn: &Connection, saga_id: SagaId) -> Result<Vec<SagaStepExecution>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM saga_step_executions WHERE saga_id = ?1 ORDER BY step_index"
    ))?;
    let raws = stmt
        .query_map(params![saga_id.to_string()], RawStep::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawStep::into_record).collect()
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn get_index(row: &Row<'_>, column: &str) -> rusqlite::Result<usize> {
    let value: i64 = row.get(column)?;
    usize::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, value))
}

fn encode(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn encode_opt(value: Option<&Value>) -> Result<Option<String>> {
    value.map(encode).transpose()
}

fn decode_opt(text: Option<String>) -> Result<Option<Value>> {
    Ok(text.as_deref().map(serde_json::from_str).transpose()?)
}

struct RawSaga {
    id: String,
    saga_name: String,
    tenant_id: String,
    correlation_id: String,
    status: String,
    current_step: Option<String>,
    current_step_index: usize,
    total_steps: usize,
    input_data: String,
    output_data: Option<String>,
    error_data: Option<String>,
    context_data: String,
    metadata: String,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl RawSaga {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            saga_name: row.get("saga_name")?,
            tenant_id: row.get("tenant_id")?,
            correlation_id: row.get("correlation_id")?,
            status: row.get("status")?,
            current_step: row.get("current_step")?,
            current_step_index: get_index(row, "current_step_index")?,
            total_steps: get_index(row, "total_steps")?,
            input_data: row.get("input_data")?,
            output_data: row.get("output_data")?,
            error_data: row.get("error_data")?,
            context_data: row.get("context_data")?,
            metadata: row.get("metadata")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<SagaExecution> {
        Ok(SagaExecution {
            id: self.id.parse()?,
            saga_name: self.saga_name,
            tenant_id: self.tenant_id,
            correlation_id: self.correlation_id,
            status: self.status.parse()?,
            current_step: self.current_step,
            current_step_index: self.current_step_index,
            total_steps: self.total_steps,
            input_data: serde_json::from_str(&self.input_data)?,
            output_data: decode_opt(self.output_data)?,
            error_data: decode_opt(self.error_data)?,
            context_data: serde_json::from_str(&self.context_data)?,
            metadata: serde_json::from_str(&self.metadata)?,
            started_at: self.started_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

struct RawStep {
    id: String,
    saga_id: String,
    step_name: String,
    step_index: usize,
    status: String,
    attempt_count: u32,
    max_attempts: u32,
    input_data: Option<String>,
    output_data: Option<String>,
    error_message: Option<String>,
    error_data: Option<String>,
    compensation_data: Option<String>,
    compensation_attempts: u32,
    max_compensation_attempts: u32,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl RawStep {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            saga_id: row.get("saga_id")?,
            step_name: row.get("step_name")?,
            step_index: get_index(row, "step_index")?,
            status: row.get("status")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            input_data: row.get("input_data")?,
            output_data: row.get("output_data")?,
            error_message: row.get("error_message")?,
            error_data: row.get("error_data")?,
            compensation_data: row.get("compensation_data")?,
            compensation_attempts: row.get("compensation_attempts")?,
            max_compensation_attempts: row.get("max_compensation_attempts")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<SagaStepExecution> {
        Ok(SagaStepExecution {
            id: self.id.parse::<StepExecutionId>()?,
            saga_id: self.saga_id.parse()?,
            step_name: self.step_name,
            step_index: self.step_index,
            status: self.status.parse()?,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            input_data: decode_opt(self.input_data)?,
            output_data: decode_opt(self.output_data)?,
            error_message: self.error_message,
            error_data: decode_opt(self.error_data)?,
            compensation_data: decode_opt(self.compensation_data)?,
            compensation_attempts: self.compensation_attempts,
            max_compensation_attempts: self.max_compensation_attempts,
            started_at: self.started_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}
