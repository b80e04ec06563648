//! Integration tests for a failing tenant provisioning saga.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opflow_core::{HandlerError, ManualClock, OpflowConfig, SagaStatus, StepStatus};
use opflow_saga::{
    HandlerRegistry, InMemorySagaStore, RecordingAlertSink, RetryPolicy, SagaBuilder,
    SagaDefinition, SagaEngine, SagaError, SagaFilter, SagaProgress, SagaStart, StepContext,
    StepDefinition, StepHandler, ValidationError,
};
use serde_json::{Value, json};

type Log = Arc<Mutex<Vec<String>>>;

struct Provisioner {
    name: &'static str,
    log: Log,
    fail_execute: bool,
    fail_compensate: Arc<AtomicBool>,
}

impl Provisioner {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: log.clone(),
            fail_execute: false,
            fail_compensate: Arc::new(AtomicBool::new(false)),
        }
    }

    fn failing(mut self) -> Self {
        self.fail_execute = true;
        self
    }

    fn failing_compensation(mut self, flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        self.fail_compensate = flag.clone();
        self
    }

    fn record(&self, entry: String) {
        self.log.lock().expect("log lock").push(entry);
    }
}

#[async_trait]
impl StepHandler for Provisioner {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: &StepContext, _input: Value) -> Result<Value, HandlerError> {
        self.record(format!("execute {} #{}", self.name, ctx.attempt));
        if self.fail_execute {
            return Err(HandlerError::new("directory unavailable")
                .with_data(json!({"status": 503})));
        }
        Ok(json!({ "resource": format!("{}-{}", self.name, ctx.tenant_id) }))
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        output: Value,
    ) -> Result<Option<Value>, HandlerError> {
        self.record(format!("compensate {} #{}", self.name, ctx.attempt));
        if self.fail_compensate.load(Ordering::SeqCst) {
            return Err(HandlerError::new("database is locked"));
        }
        Ok(Some(json!({ "removed": output["resource"] })))
    }

    fn compensation_description(&self) -> String {
        format!("tear down {}", self.name)
    }
}

fn provisioning() -> SagaDefinition {
    SagaBuilder::new("tenant-provisioning")
        .step(StepDefinition::new("create_db"))
        .step(StepDefinition::new("create_admin"))
        .step(StepDefinition::new("send_welcome_email"))
        .build()
        .expect("definition is valid")
}

fn engine(
    handlers: Vec<Provisioner>,
    alerts: Arc<RecordingAlertSink>,
) -> anyhow::Result<SagaEngine> {
    let mut registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register(handler)?;
    }
    Ok(SagaEngine::new(
        Arc::new(InMemorySagaStore::new()),
        registry,
        Arc::new(ManualClock::fixed()),
        &OpflowConfig::default(),
    )
    .with_retry_policy(RetryPolicy::immediate())
    .with_alert_sink(alerts))
}

#[tokio::test]
async fn failed_admin_creation_rolls_back_database_only() -> anyhow::Result<()> {
    let log = Log::default();
    let alerts = Arc::new(RecordingAlertSink::new());
    let engine = engine(
        vec![
            Provisioner::new("create_db", &log),
            Provisioner::new("create_admin", &log).failing(),
            Provisioner::new("send_welcome_email", &log),
        ],
        alerts.clone(),
    )?;

    let input = json!({"plan": "pro"});
    let id = engine.start_saga(&provisioning(), SagaStart::new("acme", input))?;
    let saga = engine.run_to_completion(id).await?;
    let steps = engine.get_steps(id)?;

    assert_eq!(saga.status, SagaStatus::Compensated);
    assert!(saga.completed_at.is_some());
    assert_eq!(
        *log.lock().expect("log lock"),
        [
            "execute create_db #1",
            "execute create_admin #1",
            "execute create_admin #2",
            "execute create_admin #3",
            "compensate create_db #1",
        ]
    );

    assert_eq!(steps[0].status, StepStatus::Compensated);
    assert_eq!(
        steps[0].compensation_data,
        Some(json!({"removed": "create_db-acme"}))
    );
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(steps[1].attempt_count, 3);
    assert_eq!(
        steps[1].error_data,
        Some(json!({"message": "directory unavailable", "data": {"status": 503}}))
    );
    assert_eq!(steps[2].status, StepStatus::Pending);
    assert_eq!(steps[2].attempt_count, 0);

    let error = saga.error_data.expect("failure is recorded");
    assert_eq!(error["step"], "create_admin");
    assert_eq!(error["cause"], "directory unavailable");
    assert!(alerts.alerts().is_empty());

    let summary = engine.audit_log(id)?.summary();
    assert!(summary.contains("↩ create_db (1/3 attempts) (compensation 1/3)"));
    assert!(summary.contains("✗ create_admin (3/3 attempts): directory unavailable"));
    assert!(summary.contains("· send_welcome_email"));
    Ok(())
}

#[tokio::test]
async fn exhausted_compensation_stalls_and_alerts_once() -> anyhow::Result<()> {
    let log = Log::default();
    let locked = Arc::new(AtomicBool::new(false));
    let alerts = Arc::new(RecordingAlertSink::new());
    let engine = engine(
        vec![
            Provisioner::new("create_db", &log).failing_compensation(&locked),
            Provisioner::new("create_admin", &log).failing(),
            Provisioner::new("send_welcome_email", &log),
        ],
        alerts.clone(),
    )?;
    let id = engine.start_saga(&provisioning(), SagaStart::new("acme", Value::Null))?;

    let saga = engine.run_to_completion(id).await?;

    assert_eq!(saga.status, SagaStatus::Compensating);
    assert!(saga.completed_at.is_none());
    let raised = alerts.alerts();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].saga_id, id);
    assert_eq!(raised[0].step, "create_db");
    assert_eq!(raised[0].attempts, 3);
    assert!(raised[0].message.contains("tear down create_db"));
    assert_eq!(saga.error_data.expect("alert is persisted")["alert"]["step"], "create_db");
    assert_eq!(
        engine.stalled_sagas()?.iter().map(|s| s.id).collect::<Vec<_>>(),
        [id]
    );

    let calls_before = log.lock().expect("log lock").len();
    let progress = engine.advance(id).await?;
    assert!(matches!(
        progress,
        SagaProgress::CompensationStalled {
            ref step,
            error: SagaError::CompensationExhausted { attempts: 3, .. },
        } if step == "create_db"
    ));
    assert_eq!(log.lock().expect("log lock").len(), calls_before);
    assert_eq!(alerts.alerts().len(), 1);
    Ok(())
}

#[tokio::test]
async fn operator_retry_finishes_stalled_rollback() -> anyhow::Result<()> {
    let log = Log::default();
    let locked = Arc::new(AtomicBool::new(false));
    let alerts = Arc::new(RecordingAlertSink::new());
    let engine = engine(
        vec![
            Provisioner::new("create_db", &log).failing_compensation(&locked),
            Provisioner::new("create_admin", &log).failing(),
            Provisioner::new("send_welcome_email", &log),
        ],
        alerts.clone(),
    )?;
    let id = engine.start_saga(&provisioning(), SagaStart::new("acme", Value::Null))?;
    engine.run_to_completion(id).await?;

    locked.store(false, Ordering::SeqCst);
    let rearmed = engine.retry_compensation(id)?;
    let saga = engine.run_to_completion(id).await?;

    assert_eq!(rearmed.compensation_attempts, 0);
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(engine.get_steps(id)?[0].status, StepStatus::Compensated);
    assert!(engine.stalled_sagas()?.is_empty());
    assert_eq!(
        log.lock().expect("log lock").last().map(String::as_str),
        Some("compensate create_db #1")
    );
    Ok(())
}

#[tokio::test]
async fn unregistered_handler_is_rejected_before_persisting() -> anyhow::Result<()> {
    let log = Log::default();
    let engine = engine(
        vec![Provisioner::new("create_db", &log)],
        Arc::new(RecordingAlertSink::new()),
    )?;

    let result = engine.start_saga(&provisioning(), SagaStart::new("acme", Value::Null));

    assert!(matches!(
        result,
        Err(SagaError::Validation(ValidationError::UnregisteredHandler { ref handler, .. }))
            if handler == "create_admin"
    ));
    assert!(engine.list_sagas(&SagaFilter::default())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn sagas_are_listed_per_tenant() -> anyhow::Result<()> {
    let log = Log::default();
    let engine = engine(
        vec![
            Provisioner::new("create_db", &log),
            Provisioner::new("create_admin", &log),
            Provisioner::new("send_welcome_email", &log),
        ],
        Arc::new(RecordingAlertSink::new()),
    )?;
    let done = engine.start_saga(&provisioning(), SagaStart::new("acme", Value::Null))?;
    engine.start_saga(&provisioning(), SagaStart::new("acme", Value::Null))?;
    engine.start_saga(&provisioning(), SagaStart::new("globex", Value::Null))?;
    engine.run_to_completion(done).await?;

    let acme = engine.list_sagas(&SagaFilter::default().tenant("acme"))?;
    let completed = engine.list_sagas(&SagaFilter::default().status(SagaStatus::Completed))?;

    assert_eq!(acme.len(), 2);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, done);
    Ok(())
}
