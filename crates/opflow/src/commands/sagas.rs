use opflow_core::SagaStatus;
use opflow_saga::SagaFilter;

use crate::context::Context;
use crate::error::Result;
use crate::output::PlainTextFormatter;

pub(crate) fn run(
    ctx: &Context,
    tenant: Option<String>,
    status: Option<SagaStatus>,
    limit: usize,
) -> Result<()> {
    let mut filter = SagaFilter::default().limit(limit);
    if let Some(tenant) = tenant {
        filter = filter.tenant(tenant);
    }
    if let Some(status) = status {
        filter = filter.status(status);
    }

    let sagas = ctx.engine()?.list_sagas(&filter)?;
    if sagas.is_empty() {
        println!("No sagas found.");
        return Ok(());
    }
    for saga in &sagas {
        println!("{}", PlainTextFormatter::saga_row(saga));
    }
    Ok(())
}
