//! Seeds a ledger file the way a running service would leave it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opflow_core::{HandlerError, OpflowConfig, SagaId, SystemClock};
use opflow_idempotency::{IdempotencyLedger, NewOperation, SqliteIdempotencyStore};
use opflow_saga::{
    HandlerRegistry, RetryPolicy, SagaBuilder, SagaEngine, SagaStart, SqliteSagaStore,
    StepContext, StepDefinition, StepHandler,
};
use serde_json::{Value, json};
use tempfile::TempDir;

struct Provision {
    name: &'static str,
    fail_execute: bool,
    fail_compensate: bool,
}

#[async_trait]
impl StepHandler for Provision {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: &StepContext, _input: Value) -> Result<Value, HandlerError> {
        if self.fail_execute {
            return Err(HandlerError::new("directory unavailable"));
        }
        Ok(json!({ "resource": format!("{}-{}", self.name, ctx.tenant_id) }))
    }

    async fn compensate(
        &self,
        _ctx: &StepContext,
        _output: Value,
    ) -> Result<Option<Value>, HandlerError> {
        if self.fail_compensate {
            return Err(HandlerError::new("database is locked"));
        }
        Ok(None)
    }
}

pub struct Seeded {
    pub dir: TempDir,
    pub database: PathBuf,
    pub completed: SagaId,
    pub stalled: SagaId,
    pub live_key: String,
    pub expired_key: String,
}

fn engine(database: &Path, failing: bool) -> anyhow::Result<SagaEngine> {
    let mut registry = HandlerRegistry::new();
    registry.register(Provision {
        name: "create_db",
        fail_execute: false,
        fail_compensate: failing,
    })?;
    registry.register(Provision {
        name: "create_admin",
        fail_execute: failing,
        fail_compensate: false,
    })?;
    Ok(SagaEngine::new(
        Arc::new(SqliteSagaStore::open(database)?),
        registry,
        Arc::new(SystemClock),
        &OpflowConfig::default(),
    )
    .with_retry_policy(RetryPolicy::immediate()))
}

/// One completed saga for `acme`, one stalled rollback for `globex`, one
/// live and one already expired idempotency record.
pub async fn seed() -> anyhow::Result<Seeded> {
    let dir = TempDir::new()?;
    let database = dir.path().join("opflow.db");
    let definition = SagaBuilder::new("tenant-provisioning")
        .step(StepDefinition::new("create_db").max_compensation_attempts(1))
        .step(StepDefinition::new("create_admin").max_attempts(1))
        .build()?;

    let healthy = engine(&database, false)?;
    let completed = healthy.start_saga(&definition, SagaStart::new("acme", json!({})))?;
    healthy.run_to_completion(completed).await?;

    let broken = engine(&database, true)?;
    let stalled = broken.start_saga(&definition, SagaStart::new("globex", json!({})))?;
    broken.run_to_completion(stalled).await?;

    let ledger = IdempotencyLedger::new(
        Arc::new(SqliteIdempotencyStore::open(&database)?),
        Arc::new(SystemClock),
        OpflowConfig::default().idempotency,
    );
    let live = NewOperation::new("acme", "billing.charge", json!({"amount": 42}));
    let live_key = ledger.create(&live)?.record.idempotency_key;
    ledger.begin_attempt(&live_key)?;
    ledger.complete(&live_key, json!({"charged": 42}))?;

    let stale = NewOperation::new("acme", "billing.refund", json!({"amount": 7}))
        .with_ttl(Duration::from_millis(1));
    let expired_key = ledger.create(&stale)?.record.idempotency_key;
    tokio::time::sleep(Duration::from_millis(20)).await;

    Ok(Seeded {
        dir,
        database,
        completed,
        stalled,
        live_key,
        expired_key,
    })
}
