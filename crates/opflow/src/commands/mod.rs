mod check;
mod key;
mod purge;
mod sagas;
mod stalled;
mod status;

use clap::Subcommand;
use opflow_core::{SagaId, SagaStatus};

use crate::context::Context;
use crate::error::Result;

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Show a saga with its per-step audit log
    Status {
        /// Saga execution id
        saga_id: SagaId,
    },
    /// List sagas, newest first
    Sagas {
        /// Only sagas of this tenant
        #[arg(long)]
        tenant: Option<String>,
        /// Only sagas in this status
        #[arg(long)]
        status: Option<SagaStatus>,
        /// Maximum number of rows
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List sagas whose compensation is waiting for an operator
    Stalled,
    /// Look up an idempotency record by key
    Check {
        /// Idempotency key (hex SHA-256)
        key: String,
    },
    /// Print the idempotency key for a request without touching the ledger
    Key {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        operation: String,
        /// Request parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Delete expired idempotency records
    Purge,
}

impl Commands {
    pub(crate) fn execute(self, ctx: &Context) -> Result<()> {
        match self {
            Self::Status { saga_id } => status::run(ctx, saga_id),
            Self::Sagas {
                tenant,
                status,
                limit,
            } => sagas::run(ctx, tenant, status, limit),
            Self::Stalled => stalled::run(ctx),
            Self::Check { key } => check::run(ctx, &key),
            Self::Key {
                tenant,
                user,
                operation,
                params,
            } => key::run(&tenant, user.as_deref(), &operation, &params),
            Self::Purge => purge::run(ctx),
        }
    }
}
