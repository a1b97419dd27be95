//! Database connectivity check

use std::path::Path;

use anyhow::{Context, Result};
use packline_core::pool::redact_url;
use packline_core::QueryCatalog;
use tracing::info;

pub async fn run_check(config_path: Option<&Path>) -> Result<()> {
    let (config, pool) = super::connect(config_path).await?;

    let result = pool.ping().await.context("SELECT 1 failed");
    pool.close().await;
    result?;
    info!(backend = %pool.backend(), "database reachable");

    // A bad catalog file should surface here rather than mid-batch.
    let catalog = QueryCatalog::new(&config.queries.dir);
    let queries = if catalog.dir().is_dir() {
        catalog
            .preload()
            .with_context(|| format!("Failed to load queries from {}", catalog.dir().display()))?
    } else {
        0
    };

    println!("ok {} ({queries} queries)", redact_url(&config.database.url));
    Ok(())
}
