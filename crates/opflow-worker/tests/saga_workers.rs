//! Integration tests for driving sagas through the worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opflow_core::{
    Clock, HandlerError, ManualClock, OpflowConfig, SagaId, SagaStatus, SystemClock,
};
use opflow_idempotency::{IdempotencyLedger, InMemoryIdempotencyStore};
use opflow_saga::{
    HandlerRegistry, InMemorySagaStore, SagaBuilder, SagaDefinition, SagaEngine, SagaStart,
    StepContext, StepDefinition, StepHandler,
};
use opflow_worker::{BackgroundOperationsManager, OperationRegistry, Priority, TaskKind};
use serde_json::{Value, json};

const WAIT: Duration = Duration::from_secs(10);

/// Tracks how many executions of each saga overlap.
#[derive(Default)]
struct Guarded {
    running: Mutex<HashMap<SagaId, u32>>,
    max_overlap: AtomicU32,
    calls: AtomicU32,
}

struct GuardedHandler(Arc<Guarded>);

#[async_trait]
impl StepHandler for GuardedHandler {
    fn name(&self) -> &str {
        "guarded"
    }

    async fn execute(&self, ctx: &StepContext, _input: Value) -> Result<Value, HandlerError> {
        let overlap = {
            let mut running = self.0.running.lock().expect("running lock");
            let count = running.entry(ctx.saga_id).or_default();
            *count += 1;
            *count
        };
        self.0.max_overlap.fetch_max(overlap, Ordering::SeqCst);
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        *self
            .0
            .running
            .lock()
            .expect("running lock")
            .entry(ctx.saga_id)
            .or_default() -= 1;
        Ok(json!(ctx.step_index))
    }
}

/// Counts executions of a step that outlives its lease on the first call.
#[derive(Default)]
struct Slow {
    calls: AtomicU32,
    running: AtomicU32,
    max_running: AtomicU32,
    cancelled: AtomicBool,
}

struct SlowHandler {
    state: Arc<Slow>,
    clock: Arc<ManualClock>,
}

/// Marks a call that was dropped before it returned.
struct InFlight<'a> {
    state: &'a Slow,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.state.cancelled.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StepHandler for SlowHandler {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, ctx: &StepContext, _input: Value) -> Result<Value, HandlerError> {
        let call = self.state.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_running.fetch_max(running, Ordering::SeqCst);
        let mut in_flight = InFlight {
            state: &self.state,
            finished: false,
        };
        if call == 1 {
            self.clock.advance(Duration::from_secs(120));
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        in_flight.finished = true;
        Ok(json!(ctx.step_index))
    }
}

fn config() -> OpflowConfig {
    let mut config = OpflowConfig::default();
    config.workers.count = 4;
    config.workers.poll_interval_ms = 5;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config
}

fn manager(registry: HandlerRegistry, clock: Arc<dyn Clock>) -> BackgroundOperationsManager {
    manager_with(registry, clock, &config())
}

fn manager_with(
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    config: &OpflowConfig,
) -> BackgroundOperationsManager {
    let engine = SagaEngine::new(
        Arc::new(InMemorySagaStore::new()),
        registry,
        clock.clone(),
        config,
    );
    let ledger = IdempotencyLedger::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        clock.clone(),
        config.idempotency.clone(),
    );
    BackgroundOperationsManager::new(engine, ledger, OperationRegistry::new(), clock, config)
}

fn four_steps() -> SagaDefinition {
    SagaBuilder::new("four")
        .step(StepDefinition::new("s0").handler("guarded"))
        .step(StepDefinition::new("s1").handler("guarded"))
        .step(StepDefinition::new("s2").handler("guarded"))
        .step(StepDefinition::new("s3").handler("guarded"))
        .build()
        .expect("definition is valid")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_saga_is_advanced_by_one_worker_at_a_time() -> anyhow::Result<()> {
    let guarded = Arc::new(Guarded::default());
    let mut registry = HandlerRegistry::new();
    registry.register(GuardedHandler(guarded.clone()))?;
    let manager = manager(registry, Arc::new(SystemClock));

    let mut ids = Vec::new();
    for tenant in ["acme", "globex", "initech"] {
        let saga_id = manager.start_saga(
            &four_steps(),
            SagaStart::new(tenant, Value::Null),
            Priority::Normal,
        )?;
        // Duplicate wake-ups must not run a step twice.
        for _ in 0..5 {
            manager.enqueue(TaskKind::AdvanceSaga { saga_id }, Priority::High)?;
        }
        ids.push(saga_id);
    }
    manager.start()?;

    for saga_id in &ids {
        let saga = manager.wait_for_saga(*saga_id, WAIT).await?;
        assert_eq!(saga.status, SagaStatus::Completed);
    }
    manager.shutdown().await;

    assert_eq!(guarded.max_overlap.load(Ordering::SeqCst), 1);
    assert_eq!(guarded.calls.load(Ordering::SeqCst), 12);
    Ok(())
}

#[tokio::test]
async fn abandoned_claim_is_reclaimed_after_lease_expiry() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::fixed());
    let guarded = Arc::new(Guarded::default());
    let mut registry = HandlerRegistry::new();
    registry.register(GuardedHandler(guarded.clone()))?;
    let manager = manager(registry, clock.clone());

    let saga_id = manager
        .engine()
        .start_saga(&four_steps(), SagaStart::new("acme", Value::Null))?;
    let key = TaskKind::AdvanceSaga { saga_id }.claim_key();
    // A worker that crashed while holding the saga.
    let crashed = manager
        .claims()
        .try_claim(&key, "crashed-worker")
        .expect("claim is free");
    std::mem::forget(crashed);

    manager.enqueue(TaskKind::AdvanceSaga { saga_id }, Priority::Normal)?;
    manager.start()?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        manager.engine().get_saga_status(saga_id)?.status,
        SagaStatus::Pending
    );

    // The first claimant after expiry only revokes the lease.
    clock.advance(config().workers.lease_timeout() + Duration::from_secs(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        manager.engine().get_saga_status(saga_id)?.status,
        SagaStatus::Pending
    );
    assert!(manager.claims().lease(&key).is_some_and(|lease| lease.revoked));

    clock.advance(config().workers.lease_timeout() + Duration::from_secs(1));
    let saga = manager.wait_for_saga(saga_id, WAIT).await?;
    manager.shutdown().await;

    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(guarded.calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn step_is_abandoned_when_its_lease_expires_mid_run() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::fixed());
    let slow = Arc::new(Slow::default());
    let mut registry = HandlerRegistry::new();
    registry.register(SlowHandler {
        state: slow.clone(),
        clock: clock.clone(),
    })?;
    let mut config = config();
    config.workers.count = 2;
    config.workers.lease_timeout_ms = 150;
    let manager = manager_with(registry, clock.clone(), &config);

    let definition = SagaBuilder::new("slow")
        .step(StepDefinition::new("s0").handler("slow"))
        .build()?;
    let saga_id = manager.start_saga(
        &definition,
        SagaStart::new("acme", Value::Null),
        Priority::Normal,
    )?;
    manager.enqueue(TaskKind::AdvanceSaga { saga_id }, Priority::Normal)?;
    manager.start()?;

    let saga = manager.wait_for_saga(saga_id, WAIT).await?;
    manager.shutdown().await;

    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    assert_eq!(slow.max_running.load(Ordering::SeqCst), 1);
    assert!(slow.cancelled.load(Ordering::SeqCst));
    let steps = manager.engine().get_steps(saga_id)?;
    assert_eq!(steps[0].attempt_count, 2);
    Ok(())
}

#[tokio::test]
async fn shutdown_rejects_new_work() -> anyhow::Result<()> {
    let manager = manager(HandlerRegistry::new(), Arc::new(SystemClock));
    manager.start()?;

    manager.shutdown().await;

    assert!(manager
        .enqueue(
            TaskKind::AdvanceSaga {
                saga_id: SagaId::new()
            },
            Priority::Low
        )
        .is_err());
    assert!(manager.start().is_err());
    Ok(())
}
