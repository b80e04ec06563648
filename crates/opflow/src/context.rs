use std::path::{Path, PathBuf};
use std::sync::Arc;

use opflow_core::{OpflowConfig, SystemClock};
use opflow_idempotency::{IdempotencyLedger, SqliteIdempotencyStore};
use opflow_saga::{HandlerRegistry, SagaEngine, SqliteSagaStore};
use tracing::debug;

use crate::error::{CliError, Result};

/// Read when `--config` is not given and the file exists.
const DEFAULT_CONFIG: &str = "opflow.toml";

/// Resolved configuration plus the ledger file the commands operate on.
pub(crate) struct Context {
    config: OpflowConfig,
    database: Option<PathBuf>,
}

impl Context {
    /// An explicit `--config` must exist; `--database` wins over the
    /// config's `database_path`.
    pub(crate) fn resolve(config: Option<&Path>, database: Option<PathBuf>) -> Result<Self> {
        let config = match config {
            Some(path) => OpflowConfig::load(path)?,
            None => OpflowConfig::load_or_default(Path::new(DEFAULT_CONFIG))?,
        };
        let database = database.or_else(|| config.database_path.clone());
        debug!(database = ?database, "resolved cli context");
        Ok(Self { config, database })
    }

    fn database(&self) -> Result<&Path> {
        let path = self.database.as_deref().ok_or(CliError::NoDatabase)?;
        if !path.exists() {
            return Err(CliError::DatabaseNotFound(path.to_path_buf()));
        }
        Ok(path)
    }

    /// An engine with no handlers: enough to read and inspect sagas.
    pub(crate) fn engine(&self) -> Result<SagaEngine> {
        let store = SqliteSagaStore::open(self.database()?)?;
        Ok(SagaEngine::new(
            Arc::new(store),
            HandlerRegistry::new(),
            Arc::new(SystemClock),
            &self.config,
        ))
    }

    pub(crate) fn ledger(&self) -> Result<IdempotencyLedger> {
        let store = SqliteIdempotencyStore::open(self.database()?)?;
        Ok(IdempotencyLedger::new(
            Arc::new(store),
            Arc::new(SystemClock),
            self.config.idempotency.clone(),
        ))
    }
}
