use opflow_core::SagaId;

use crate::context::Context;
use crate::error::Result;
use crate::output::PlainTextFormatter;

pub(crate) fn run(ctx: &Context, saga_id: SagaId) -> Result<()> {
    let engine = ctx.engine()?;
    let saga = engine.get_saga_status(saga_id)?;
    let audit = engine.audit_log(saga_id)?;

    print!("{}", PlainTextFormatter::saga_detail(&saga, &audit));
    Ok(())
}
