use opflow_idempotency::generate_key;
use serde_json::Value;

use crate::error::{CliError, Result};

pub(crate) fn run(tenant: &str, user: Option<&str>, operation: &str, params: &str) -> Result<()> {
    let parameters: Value = serde_json::from_str(params).map_err(CliError::InvalidParams)?;
    println!("{}", generate_key(tenant, user, operation, &parameters));
    Ok(())
}
