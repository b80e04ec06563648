use crate::context::Context;
use crate::error::Result;

pub(crate) fn run(ctx: &Context) -> Result<()> {
    let purged = ctx.ledger()?.purge_expired()?;
    println!("Purged {purged} expired record(s).");
    Ok(())
}
