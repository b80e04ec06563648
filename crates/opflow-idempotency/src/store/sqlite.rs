use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opflow_core::clock::{from_millis, to_millis};
use opflow_core::{IdempotentOperation, OperationId, OperationStatus};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params, params_from_iter,
};
use serde_json::Value;

use super::{IdempotencyStore, InsertOutcome, Transition};
use crate::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS idempotent_operations (
    id TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL UNIQUE,
    operation_type TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    user_id TEXT,
    correlation_id TEXT,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    input_data TEXT NOT NULL,
    output_data TEXT,
    error_message TEXT,
    error_data TEXT,
    execution_time_ms INTEGER,
    started_at INTEGER,
    completed_at INTEGER,
    expires_at INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotent_operations_tenant_type
    ON idempotent_operations(tenant_id, operation_type);
CREATE INDEX IF NOT EXISTS idx_idempotent_operations_status
    ON idempotent_operations(status);
CREATE INDEX IF NOT EXISTS idx_idempotent_operations_expires_at
    ON idempotent_operations(expires_at);
";

const COLUMNS: &str = "id, idempotency_key, operation_type, tenant_id, user_id, correlation_id, \
     status, attempt_count, max_attempts, input_data, output_data, error_message, error_data, \
     execution_time_ms, started_at, completed_at, expires_at, metadata, created_at, updated_at";

/// Idempotency store persisted in the `idempotent_operations` table.
///
/// Creation relies on the UNIQUE constraint on `idempotency_key`
/// (`INSERT ... ON CONFLICT DO NOTHING`), so duplicate rows are impossible
/// even across processes sharing the database file.
#[derive(Debug, Clone)]
pub struct SqliteIdempotencyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIdempotencyStore {
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

    /// Share an existing connection, e.g. with the saga store.
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

impl IdempotencyStore for SqliteIdempotencyStore {
    fn insert_if_absent(
        &self,
        record: IdempotentOperation,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM idempotent_operations WHERE idempotency_key = ?1 AND expires_at <= ?2",
                params![record.idempotency_key, to_millis(now)],
            )?;
            let inserted = tx.execute(
                &format!(
                    "INSERT INTO idempotent_operations ({COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20) \
                     ON CONFLICT(idempotency_key) DO NOTHING"
                ),
                params![
                    record.id.to_string(),
                    record.idempotency_key,
                    record.operation_type,
                    record.tenant_id,
                    record.user_id,
                    record.correlation_id,
                    record.status.as_str(),
                    record.attempt_count,
                    record.max_attempts,
                    encode(&record.input_data)?,
                    encode_opt(record.output_data.as_ref())?,
                    record.error_message,
                    encode_opt(record.error_data.as_ref())?,
                    record.execution_time_ms,
                    record.started_at.map(to_millis),
                    record.completed_at.map(to_millis),
                    to_millis(record.expires_at),
                    encode(&record.metadata)?,
                    to_millis(record.created_at),
                    to_millis(record.updated_at),
                ],
            )?;
            let stored = select_by_key(tx, &record.idempotency_key)?.ok_or_else(|| {
                crate::IdempotencyError::NotFound {
                    key: record.idempotency_key.clone(),
                }
            })?;
            Ok(InsertOutcome {
                record: stored,
                created: inserted == 1,
            })
        })
    }

    fn get(&self, key: &str) -> Result<Option<IdempotentOperation>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM idempotent_operations WHERE idempotency_key = ?1"),
                params![key],
                RawOperation::from_row,
            )
            .optional()?;
        raw.map(RawOperation::into_record).transpose()
    }

    fn transition(
        &self,
        key: &str,
        expected: &[OperationStatus],
        update: &mut dyn FnMut(&mut IdempotentOperation),
    ) -> Result<Transition> {
        self.with_tx(|tx| {
            let Some(mut record) = select_by_key(tx, key)? else {
                return Ok(Transition::Missing);
            };
            if !expected.contains(&record.status) {
                return Ok(Transition::Rejected(record));
            }
            update(&mut record);
            tx.execute(
                "UPDATE idempotent_operations SET status = ?2, attempt_count = ?3, \
                 output_data = ?4, error_message = ?5, error_data = ?6, execution_time_ms = ?7, \
                 started_at = ?8, completed_at = ?9, expires_at = ?10, metadata = ?11, \
                 updated_at = ?12 WHERE idempotency_key = ?1",
                params![
                    key,
                    record.status.as_str(),
                    record.attempt_count,
                    encode_opt(record.output_data.as_ref())?,
                    record.error_message,
                    encode_opt(record.error_data.as_ref())?,
                    record.execution_time_ms,
                    record.started_at.map(to_millis),
                    record.completed_at.map(to_millis),
                    to_millis(record.expires_at),
                    encode(&record.metadata)?,
                    to_millis(record.updated_at),
                ],
            )?;
            Ok(Transition::Applied(record))
        })
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let deleted = conn.execute(
            "DELETE FROM idempotent_operations WHERE expires_at <= ?1",
            params![to_millis(now)],
        )?;
        Ok(deleted)
    }

    fn list_by_status(
        &self,
        statuses: &[OperationStatus],
        now: DateTime<Utc>,
    ) -> Result<Vec<IdempotentOperation>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {COLUMNS} FROM idempotent_operations \
             WHERE expires_at > ? AND status IN ({placeholders}) ORDER BY created_at"
        );
        let mut values = vec![SqlValue::Integer(to_millis(now))];
        values.extend(
            statuses
                .iter()
                .map(|s| SqlValue::Text(s.as_str().to_string())),
        );

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_from_iter(values), RawOperation::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawOperation::into_record).collect()
    }
}

fn select_by_key(tx: &Transaction<'_>, key: &str) -> Result<Option<IdempotentOperation>> {
    let raw = tx
        .query_row(
            &format!("SELECT {COLUMNS} FROM idempotent_operations WHERE idempotency_key = ?1"),
            params![key],
            RawOperation::from_row,
        )
        .optional()?;
    raw.map(RawOperation::into_record).transpose()
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

/// Column values as SQLite hands them back, before domain decoding.
struct RawOperation {
    id: String,
    idempotency_key: String,
    operation_type: String,
    tenant_id: String,
    user_id: Option<String>,
    correlation_id: Option<String>,
    status: String,
    attempt_count: u32,
    max_attempts: u32,
    input_data: String,
    output_data: Option<String>,
    error_message: Option<String>,
    error_data: Option<String>,
    execution_time_ms: Option<u64>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    expires_at: i64,
    metadata: String,
    created_at: i64,
    updated_at: i64,
}

impl RawOperation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            idempotency_key: row.get("idempotency_key")?,
            operation_type: row.get("operation_type")?,
            tenant_id: row.get("tenant_id")?,
            user_id: row.get("user_id")?,
            correlation_id: row.get("correlation_id")?,
            status: row.get("status")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            input_data: row.get("input_data")?,
            output_data: row.get("output_data")?,
            error_message: row.get("error_message")?,
            error_data: row.get("error_data")?,
            execution_time_ms: row.get("execution_time_ms")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            expires_at: row.get("expires_at")?,
            metadata: row.get("metadata")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<IdempotentOperation> {
        Ok(IdempotentOperation {
            id: self.id.parse::<OperationId>()?,
            idempotency_key: self.idempotency_key,
            operation_type: self.operation_type,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            correlation_id: self.correlation_id,
            status: self.status.parse()?,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            input_data: serde_json::from_str(&self.input_data)?,
            output_data: decode_opt(self.output_data)?,
            error_message: self.error_message,
            error_data: decode_opt(self.error_data)?,
            execution_time_ms: self.execution_time_ms,
            started_at: self.started_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
            expires_at: from_millis(self.expires_at),
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}
