use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use opflow_core::{IdempotencyConfig, SystemClock};
use opflow_idempotency::{
    IdempotencyLedger, IdempotencyStore, InMemoryIdempotencyStore, NewOperation,
    SqliteIdempotencyStore,
};
use serde_json::json;
use tempfile::TempDir;

const CALLERS: usize = 16;

fn race(store: Arc<dyn IdempotencyStore>) -> anyhow::Result<()> {
    let ledger = IdempotencyLedger::new(store, Arc::new(SystemClock), IdempotencyConfig::default());
    let request = NewOperation::new("tenant-1", "billing.charge", json!({"amount": 100}))
        .with_user("user-1");
    let key = request.idempotency_key();
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let ledger = ledger.clone();
            let request = request.clone();
            let key = key.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ledger.create_if_absent(&key, &request)
            })
        })
        .collect();

    let mut ids = HashSet::new();
    let mut created = 0;
    for handle in handles {
        let outcome = handle.join().expect("caller thread panicked")?;
        if outcome.created {
            created += 1;
        }
        ids.insert(outcome.record.id);
    }

    assert_eq!(created, 1, "exactly one caller creates the record");
    assert_eq!(ids.len(), 1, "every caller observes the same record");
    assert_eq!(ledger.list_unfinished()?.len(), 1);
    Ok(())
}

#[test]
fn concurrent_creates_in_memory_yield_one_record() -> anyhow::Result<()> {
    race(Arc::new(InMemoryIdempotencyStore::new()))
}

#[test]
fn concurrent_creates_in_sqlite_yield_one_record() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = SqliteIdempotencyStore::open(&dir.path().join("ledger.db"))?;

    race(Arc::new(store))
}

#[test]
fn concurrent_creates_across_connections_yield_one_record() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("ledger.db");
    let request = NewOperation::new("tenant-1", "billing.charge", json!({"amount": 5}));
    let key = request.idempotency_key();
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let request = request.clone();
            let key = key.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> anyhow::Result<_> {
                let store = SqliteIdempotencyStore::open(&path)?;
                let ledger = IdempotencyLedger::new(
                    Arc::new(store),
                    Arc::new(SystemClock),
                    IdempotencyConfig::default(),
                );
                barrier.wait();
                Ok(ledger.create_if_absent(&key, &request)?)
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.join().expect("caller thread panicked")?.record.id);
    }

    assert_eq!(ids.len(), 1);
    Ok(())
}
