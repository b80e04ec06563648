use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use opflow_core::{
    Clock, HandlerError, IdempotentOperation, OpflowConfig, SagaExecution, SagaId, SagaStatus,
    TaskId, WorkerConfig,
};
use opflow_idempotency::{IdempotencyError, IdempotencyLedger, NewOperation};
use opflow_saga::{
    RetryPolicy, SagaDefinition, SagaEngine, SagaError, SagaFilter, SagaStart, StepRecord,
    StoreError,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::claim::ClaimTable;
use crate::error::{Result, WorkerError};
use crate::operations::{OperationContext, OperationRegistry};
use crate::queue::TaskQueue;
use crate::task::{Priority, Task, TaskKind};

const MIN_TICK: Duration = Duration::from_millis(1);

/// Answer to [`BackgroundOperationsManager::perform_idempotent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The key already finished; this is its stored outcome.
    Replayed(IdempotentOperation),
    /// The key is pending or running under an earlier request.
    InFlight(IdempotentOperation),
    /// A new record was created and queued.
    Scheduled { key: String, task_id: TaskId },
}

/// What a worker does with a task after running it.
enum Next {
    Done,
    Again,
    After(Duration),
}

struct Inner {
    engine: SagaEngine,
    ledger: IdempotencyLedger,
    operations: OperationRegistry,
    queue: TaskQueue,
    claims: Arc<ClaimTable>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    config: WorkerConfig,
    operation_timeout: Option<Duration>,
    shutdown: watch::Sender<bool>,
}

/// Worker pool that drives sagas and standalone idempotent operations.
///
/// Workers pull tasks from a shared priority queue. Before running a task a
/// worker takes the leased claim for its key, so a saga is advanced by one
/// worker at a time while different sagas proceed in parallel. Tasks whose
/// key is held elsewhere are deferred, not dropped.
pub struct BackgroundOperationsManager {
    inner: Arc<Inner>,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl BackgroundOperationsManager {
    #[must_use]
    pub fn new(
        engine: SagaEngine,
        ledger: IdempotencyLedger,
        operations: OperationRegistry,
        clock: Arc<dyn Clock>,
        config: &OpflowConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                engine,
                ledger,
                operations,
                queue: TaskQueue::new(),
                claims: Arc::new(ClaimTable::new(
                    clock.clone(),
                    config.workers.lease_timeout(),
                )),
                clock,
                retry: RetryPolicy::from(&config.retry),
                config: config.workers.clone(),
                operation_timeout: config.saga.step_timeout(),
                shutdown,
            }),
            workers: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &SagaEngine {
        &self.inner.engine
    }

    #[must_use]
    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.inner.ledger
    }

    #[must_use]
    pub fn claims(&self) -> &Arc<ClaimTable> {
        &self.inner.claims
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// # Errors
    ///
    /// Returns [`WorkerError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub fn enqueue(&self, kind: TaskKind, priority: Priority) -> Result<TaskId> {
        let task = Task::new(kind, priority, self.inner.clock.now());
        let id = task.id;
        debug!(task_id = %id, task = %task.kind, %priority, "task enqueued");
        if !self.inner.queue.push(task) {
            return Err(WorkerError::ShuttingDown);
        }
        Ok(id)
    }

    /// Persist a new saga and schedule its first step.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is rejected or the manager is
    /// shutting down.
    pub fn start_saga(
        &self,
        definition: &SagaDefinition,
        start: SagaStart,
        priority: Priority,
    ) -> Result<SagaId> {
        let saga_id = self.inner.engine.start_saga(definition, start)?;
        self.enqueue(TaskKind::AdvanceSaga { saga_id }, priority)?;
        Ok(saga_id)
    }

    /// Deduplicate `request` against the ledger and schedule it if new.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::UnknownOperation`] if no handler is registered
    /// for the operation type, or a ledger error.
    pub fn perform_idempotent(
        &self,
        request: &NewOperation,
        priority: Priority,
    ) -> Result<Submission> {
        if !self.inner.operations.contains(&request.operation_type) {
            return Err(WorkerError::UnknownOperation {
                operation_type: request.operation_type.clone(),
            });
        }
        let outcome = self.inner.ledger.create(request)?;
        let record = outcome.record;
        if outcome.created {
            let key = record.idempotency_key;
            let task_id = self.enqueue(
                TaskKind::IdempotentOperation { key: key.clone() },
                priority,
            )?;
            return Ok(Submission::Scheduled { key, task_id });
        }
        if record.status.is_terminal() {
            debug!(
                key = %record.idempotency_key,
                status = %record.status,
                "replaying stored outcome"
            );
            Ok(Submission::Replayed(record))
        } else {
            Ok(Submission::InFlight(record))
        }
    }

    /// Re-enqueue every unfinished saga and idempotent operation.
    ///
    /// Run once on startup. Sagas stalled behind an exhausted compensation
    /// are left for an operator.
    ///
    /// # Errors
    ///
    /// Returns an error if a ledger cannot be read.
    pub fn recover(&self) -> Result<usize> {
        let engine = &self.inner.engine;
        let stalled: HashSet<SagaId> = engine
            .stalled_sagas()?
            .into_iter()
            .map(|saga| saga.id)
            .collect();
        let mut enqueued = 0;
        for status in [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Failed,
            SagaStatus::Compensating,
        ] {
            let sagas = engine.list_sagas(&SagaFilter::default().status(status))?;
            for saga in sagas.into_iter().rev() {
                if stalled.contains(&saga.id) {
                    continue;
                }
                self.enqueue(TaskKind::AdvanceSaga { saga_id: saga.id }, Priority::Normal)?;
                enqueued += 1;
            }
        }
        for record in self.inner.ledger.list_unfinished()? {
            self.enqueue(
                TaskKind::IdempotentOperation {
                    key: record.idempotency_key,
                },
                Priority::Normal,
            )?;
            enqueued += 1;
        }
        info!(enqueued, stalled = stalled.len(), "recovered unfinished work");
        Ok(enqueued)
    }

    /// Spawn the worker pool and the expiry sweeper on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::AlreadyStarted`] on a second call, or
    /// [`WorkerError::ShuttingDown`] after shutdown.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_some() {
            return Err(WorkerError::AlreadyStarted);
        }
        if *self.inner.shutdown.borrow() {
            return Err(WorkerError::ShuttingDown);
        }

        let count = self.inner.config.count.max(1);
        let mut set = JoinSet::new();
        for index in 0..count {
            set.spawn(worker_loop(self.inner.clone(), format!("worker-{index}")));
        }
        set.spawn(sweep_loop(self.inner.clone()));
        *workers = Some(set);
        info!(workers = count, "background workers started");
        Ok(())
    }

    /// Stop handing out tasks and wait for in-flight tasks to finish.
    ///
    /// Queued tasks are discarded; their records stay in the ledgers for
    /// [`recover`](Self::recover).
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.queue.close();
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut set) = workers {
            while let Some(joined) = set.join_next().await {
                if let Err(error) = joined {
                    error!(%error, "worker task panicked");
                }
            }
        }
        info!("background workers stopped");
    }

    /// Poll until the saga is terminal or stalled.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WaitTimedOut`] after `timeout`.
    pub async fn wait_for_saga(&self, saga_id: SagaId, timeout: Duration) -> Result<SagaExecution> {
        tokio::time::timeout(timeout, self.poll_saga(saga_id))
            .await
            .map_err(|_| WorkerError::WaitTimedOut {
                what: format!("saga {saga_id}"),
                waited_ms: timeout.as_millis(),
            })?
    }

    /// Poll until the operation under `key` is completed or failed.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WaitTimedOut`] after `timeout`.
    pub async fn wait_for_operation(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<IdempotentOperation> {
        tokio::time::timeout(timeout, self.poll_operation(key))
            .await
            .map_err(|_| WorkerError::WaitTimedOut {
                what: format!("operation {key}"),
                waited_ms: timeout.as_millis(),
            })?
    }

    async fn poll_saga(&self, saga_id: SagaId) -> Result<SagaExecution> {
        loop {
            let saga = self.inner.engine.get_saga_status(saga_id)?;
            if saga.status.is_terminal() {
                return Ok(saga);
            }
            if saga.status == SagaStatus::Compensating
                && self
                    .inner
                    .engine
                    .audit_log(saga_id)?
                    .records()
                    .iter()
                    .any(StepRecord::compensation_stalled)
            {
                return Ok(saga);
            }
            tokio::time::sleep(self.inner.config.poll_interval().max(MIN_TICK)).await;
        }
    }

    async fn poll_operation(&self, key: &str) -> Result<IdempotentOperation> {
        loop {
            let record = self.inner.ledger.lookup(key)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(self.inner.config.poll_interval().max(MIN_TICK)).await;
        }
    }
}

impl Drop for BackgroundOperationsManager {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        self.inner.queue.close();
    }
}

async fn worker_loop(inner: Arc<Inner>, name: String) {
    let mut shutdown = inner.shutdown.subscribe();
    debug!(worker = %name, "worker started");
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let task = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            task = inner.queue.next() => match task {
                Some(task) => task,
                None => break,
            },
        };
        inner.run(&name, task).await;
    }
    debug!(worker = %name, "worker stopped");
}

async fn sweep_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = tokio::time::interval(inner.config.sweep_interval().max(MIN_TICK));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => inner.sweep(),
        }
    }
}

impl Inner {
    async fn run(self: &Arc<Self>, worker: &str, task: Task) {
        let key = task.kind.claim_key();
        let Some(guard) = self.claims.try_claim(&key, worker) else {
            debug!(worker, task = %task.kind, "claim held elsewhere, deferring");
            self.requeue_after(task, self.config.poll_interval());
            return;
        };

        let next = {
            let work = self.execute(&task.kind);
            tokio::pin!(work);
            let mut heartbeat =
                tokio::time::interval((self.claims.lease_timeout() / 3).max(MIN_TICK));
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    next = &mut work => break next,
                    _ = heartbeat.tick() => {
                        if !guard.renew() {
                            warn!(worker, key = %guard.key(), "lease lost, abandoning task");
                            break Next::Again;
                        }
                    }
                }
            }
        };
        drop(guard);

        match next {
            Next::Done => {}
            Next::Again => {
                self.queue.push(task);
            }
            Next::After(delay) => self.requeue_after(task, delay),
        }
    }

    fn requeue_after(self: &Arc<Self>, task: Task, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.queue.push(task);
        });
    }

    async fn execute(&self, kind: &TaskKind) -> Next {
        match kind {
            TaskKind::AdvanceSaga { saga_id } => self.advance_saga(*saga_id).await,
            TaskKind::IdempotentOperation { key } => self.run_operation(key).await,
        }
    }

    async fn advance_saga(&self, saga_id: SagaId) -> Next {
        match self.engine.advance(saga_id).await {
            Ok(progress) if progress.is_final() => {
                debug!(saga_id = %saga_id, ?progress, "saga settled");
                Next::Done
            }
            Ok(progress) => {
                debug!(saga_id = %saga_id, ?progress, "saga advanced");
                Next::Again
            }
            Err(SagaError::Store(StoreError::Storage(error))) => {
                warn!(saga_id = %saga_id, %error, "saga storage unavailable, retrying");
                Next::After(self.config.poll_interval())
            }
            Err(error) => {
                error!(saga_id = %saga_id, %error, "saga cannot advance");
                Next::Done
            }
        }
    }

    async fn run_operation(&self, key: &str) -> Next {
        let record = match self.ledger.begin_attempt(key) {
            Ok(record) => record,
            Err(IdempotencyError::Exhausted { attempts, .. }) => {
                // A worker died during the final attempt.
                let error = HandlerError::new(format!("attempts exhausted after {attempts}"));
                self.finish_operation(key, Value::Null, Some(&error));
                return Next::Done;
            }
            Err(IdempotencyError::Storage(error)) => {
                warn!(key, %error, "idempotency storage unavailable, retrying");
                return Next::After(self.config.poll_interval());
            }
            Err(error) => {
                debug!(key, %error, "operation no longer runnable");
                return Next::Done;
            }
        };

        let Some(handler) = self.operations.get(&record.operation_type) else {
            let error = HandlerError::new(format!(
                "no handler registered for '{}'",
                record.operation_type
            ));
            self.finish_operation(key, Value::Null, Some(&error));
            return Next::Done;
        };

        let ctx = OperationContext::from(&record);
        let perform = handler.perform(&ctx, record.input_data.clone());
        let result = match self.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, perform)
                .await
                .unwrap_or_else(|_| Err(HandlerError::timed_out(limit))),
            None => perform.await,
        };

        match result {
            Ok(output) => {
                self.finish_operation(key, output, None);
                Next::Done
            }
            Err(error) if record.attempt_count < record.max_attempts => {
                if let Err(failure) = self.ledger.record_attempt_failure(key, &error) {
                    warn!(key, error = %failure, "failed to record attempt error");
                }
                warn!(
                    key,
                    operation = %record.operation_type,
                    attempt = record.attempt_count,
                    max_attempts = record.max_attempts,
                    %error,
                    "operation attempt failed"
                );
                Next::After(self.retry.delay_after(record.attempt_count))
            }
            Err(error) => {
                self.finish_operation(key, Value::Null, Some(&error));
                Next::Done
            }
        }
    }

    fn finish_operation(&self, key: &str, result: Value, error: Option<&HandlerError>) {
        if let Err(failure) = self.ledger.complete_operation(key, result, error) {
            error!(key, error = %failure, "failed to record operation outcome");
        }
    }

    fn sweep(&self) {
        if let Err(error) = self.ledger.purge_expired() {
            warn!(%error, "failed to purge expired idempotency records");
        }
        let reaped = self.claims.reap_expired();
        if reaped > 0 {
            debug!(reaped, "dropped expired claims");
        }
    }
}
