//! Idempotency ledger for at-least-once operations.
//!
//! A request is fingerprinted with [`generate_key`]; the ledger guarantees at
//! most one [`IdempotentOperation`](opflow_core::IdempotentOperation) per key
//! and replays the stored outcome until the record expires. The ledger is a
//! deduplication marker, not a mutex: serializing concurrent executions
//! behind a key is the job of the worker pool's claims.

mod error;
mod key;
mod ledger;
mod store;

pub use error::{IdempotencyError, Result};
pub use key::{KEY_DOMAIN, canonical_json, generate_key};
pub use ledger::{CreateOutcome, IdempotencyLedger, NewOperation};
pub use store::{
    IdempotencyStore, InMemoryIdempotencyStore, InsertOutcome, SqliteIdempotencyStore, Transition,
};
