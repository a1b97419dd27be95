//! Command implementations for packline CLI

pub mod apply;
pub mod check;
pub mod config;
pub mod query;

use std::path::Path;

use anyhow::{Context, Result};
use packline_core::{DbPool, PacklineConfig};

pub use apply::run_apply;
pub use check::run_check;
pub use config::run_config;
pub use query::run_query;

/// Load config and open the pool every database command needs.
async fn connect(config_path: Option<&Path>) -> Result<(PacklineConfig, DbPool)> {
    let config = PacklineConfig::load(config_path).context("Failed to load configuration")?;
    let pool = DbPool::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    Ok((config, pool))
}
