//! One-shot read queries

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use packline_core::{Operation, QueryCatalog, SqlValue};

#[derive(Parser, Debug)]
pub struct QueryArgs {
    /// Catalog query id (file name under the queries dir, without .sql)
    #[arg(value_name = "ID", required_unless_present = "sql", conflicts_with = "sql")]
    pub id: Option<String>,

    /// Inline SQL instead of a catalog query
    #[arg(long, value_name = "SQL")]
    pub sql: Option<String>,

    /// Positional parameter (null, true/false, numbers, dates, or text)
    #[arg(long = "param", value_name = "VALUE")]
    pub params: Vec<String>,

    /// Print one JSON object per line instead of a pretty array
    #[arg(long)]
    pub ndjson: bool,
}

pub async fn run_query(config_path: Option<&Path>, args: QueryArgs) -> Result<()> {
    let (config, pool) = super::connect(config_path).await?;
    let params = args.params.iter().map(|raw| SqlValue::parse_literal(raw));

    let operation = match (&args.id, &args.sql) {
        (Some(id), _) => QueryCatalog::new(&config.queries.dir)
            .statement(id)
            .with_context(|| format!("Failed to load query '{id}'"))?
            .operation()
            .bind_all(params),
        (None, Some(sql)) => Operation::new(sql.as_str()).bind_all(params),
        (None, None) => anyhow::bail!("Either a query id or --sql is required"),
    };

    let result = pool.fetch_all(&operation).await;
    pool.close().await;
    let rows = result.with_context(|| format!("Query {} failed", operation.label()))?;

    if args.ndjson {
        for row in &rows {
            println!("{}", serde_json::to_string(row)?);
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(())
}
