use opflow_idempotency::IdempotencyError;

use crate::context::Context;
use crate::error::Result;
use crate::output::PlainTextFormatter;

pub(crate) fn run(ctx: &Context, key: &str) -> Result<()> {
    match ctx.ledger()?.lookup(key) {
        Ok(record) => print!("{}", PlainTextFormatter::operation_detail(&record)),
        Err(IdempotencyError::NotFound { .. }) => println!("No record for key {key}."),
        Err(IdempotencyError::Expired { expires_at, .. }) => {
            println!("Record for key {key} expired at {}.", expires_at.to_rfc3339());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
