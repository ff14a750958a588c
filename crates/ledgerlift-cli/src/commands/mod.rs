//! Command implementations

pub mod migrate;
pub mod rollback;
pub mod validate;

use crate::error::{CliError, Result};
use crate::DatabaseArgs;
use ledgerlift_engine::target::PgTargetStore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Connect to the target database named by the arguments
pub(crate) async fn connect(args: &DatabaseArgs) -> Result<PgTargetStore> {
    let url = args
        .database_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or(CliError::MissingDatabaseUrl)?;
    Ok(PgTargetStore::connect(url, args.max_connections).await?)
}

/// Token cancelled on Ctrl-C; runs observe it between pages and batches
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            child.cancel();
        }
    });
    token
}
