//! Atomic batch apply
//!
//! Loads a TOML batch file, resolves catalog queries, and runs every
//! operation in one transaction. Ctrl-C cancels the run and rolls back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use packline_core::{load_batch, CancellationToken, QueryCatalog, TransactionPipeline};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct ApplyArgs {
    /// Batch file (TOML with [[operations]] entries)
    #[arg(value_name = "BATCH")]
    pub batch: PathBuf,

    /// Per-operation timeout in seconds (overrides pipeline.statement_timeout_secs)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,
}

pub async fn run_apply(config_path: Option<&Path>, args: ApplyArgs) -> Result<()> {
    let (config, pool) = super::connect(config_path).await?;

    let catalog = QueryCatalog::new(&config.queries.dir);
    let operations = load_batch(&args.batch, &catalog)
        .with_context(|| format!("Failed to load batch {}", args.batch.display()))?;

    let mut options = config.pipeline.options();
    if let Some(secs) = args.timeout {
        options = options.with_statement_timeout(Duration::from_secs(secs));
    }
    let pipeline = TransactionPipeline::with_options(pool.clone(), options);

    let token = CancellationToken::new();
    let interrupt = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling batch");
                token.cancel();
            }
        })
    };

    let result = pipeline.execute_with_cancel(&operations, &token).await;
    interrupt.abort();
    pool.close().await;

    let receipt = result.map_err(|err| {
        let state = err.state();
        anyhow::Error::new(err).context(format!(
            "Batch {} not applied ({state})",
            args.batch.display()
        ))
    })?;

    info!(id = %receipt.id, operations = receipt.operations, "batch committed");
    let output = json!({
        "id": receipt.id.to_string(),
        "operations": receipt.operations,
        "rows_affected": receipt.rows_affected,
        "elapsed_ms": receipt.elapsed.as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
