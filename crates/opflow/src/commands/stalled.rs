use crate::context::Context;
use crate::error::Result;
use crate::output::PlainTextFormatter;

pub(crate) fn run(ctx: &Context) -> Result<()> {
    let engine = ctx.engine()?;
    let stalled = engine.stalled_sagas()?;
    if stalled.is_empty() {
        println!("No stalled sagas.");
        return Ok(());
    }

    println!("Stalled sagas: {}", stalled.len());
    println!();
    for saga in &stalled {
        let audit = engine.audit_log(saga.id)?;
        print!("{}", PlainTextFormatter::saga_detail(saga, &audit));
        println!();
    }
    Ok(())
}
