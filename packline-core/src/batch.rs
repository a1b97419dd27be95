//! Batch files: an ordered list of operations described in TOML.
//!
//! ```toml
//! [[operations]]
//! query = "insertOrderStatus"
//! params = ["A-1001", "packed"]
//!
//! [[operations]]
//! sql = "INSERT INTO order_item (order_id, line, sku) VALUES (?, ?, ?)"
//! params = ["A-1001", 1, "SKU-1"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;
use thiserror::Error;

use crate::catalog::{CatalogError, QueryCatalog};
use crate::operation::{Operation, SqlValue, Statement};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("failed to read batch file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse batch file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("batch contains no operations")]
    Empty,

    #[error("operation {index}: set exactly one of `query` or `sql`")]
    AmbiguousStatement { index: usize },

    #[error("operation {index}, param {param}: {reason}")]
    UnsupportedParam {
        index: usize,
        param: usize,
        reason: String,
    },

    #[error("operation {index}: {source}")]
    Catalog {
        index: usize,
        #[source]
        source: CatalogError,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchFile {
    #[serde(default)]
    operations: Vec<BatchEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchEntry {
    query: Option<String>,
    sql: Option<String>,
    #[serde(default)]
    params: Vec<toml::Value>,
}

/// Read and resolve a batch file.
pub fn load_batch(path: &Path, catalog: &QueryCatalog) -> Result<Vec<Operation>, BatchError> {
    let content = fs::read_to_string(path).map_err(|source| BatchError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_batch(&content, catalog)
}

/// Resolve batch TOML into operations, preserving entry order.
pub fn parse_batch(content: &str, catalog: &QueryCatalog) -> Result<Vec<Operation>, BatchError> {
    let file: BatchFile = toml::from_str(content)?;
    if file.operations.is_empty() {
        return Err(BatchError::Empty);
    }

    file.operations
        .into_iter()
        .enumerate()
        .map(|(index, entry)| resolve_entry(index, entry, catalog))
        .collect()
}

fn resolve_entry(
    index: usize,
    entry: BatchEntry,
    catalog: &QueryCatalog,
) -> Result<Operation, BatchError> {
    let statement = match (entry.query, entry.sql) {
        (Some(id), None) => catalog
            .statement(&id)
            .map_err(|source| BatchError::Catalog { index, source })?,
        (None, Some(sql)) if !sql.trim().is_empty() => Statement::new(sql),
        _ => return Err(BatchError::AmbiguousStatement { index }),
    };

    let params = entry
        .params
        .into_iter()
        .enumerate()
        .map(|(param, value)| {
            toml_to_sql(value).map_err(|reason| BatchError::UnsupportedParam {
                index,
                param,
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Operation::from_statement(statement).bind_all(params))
}

fn toml_to_sql(value: toml::Value) -> Result<SqlValue, String> {
    match value {
        toml::Value::String(s) => Ok(SqlValue::Text(s)),
        toml::Value::Integer(n) => Ok(SqlValue::Int(n)),
        toml::Value::Float(f) => Ok(SqlValue::Float(f)),
        toml::Value::Boolean(b) => Ok(SqlValue::Bool(b)),
        toml::Value::Datetime(dt) => datetime_to_sql(&dt),
        toml::Value::Array(_) => Err("arrays are not valid parameters".to_string()),
        toml::Value::Table(_) => Err("tables are not valid parameters".to_string()),
    }
}

// Offsets are dropped; parameters are bound as naive local values.
fn datetime_to_sql(dt: &toml::value::Datetime) -> Result<SqlValue, String> {
    let date = dt
        .date
        .map(|d| NaiveDate::from_ymd_opt(d.year.into(), d.month.into(), d.day.into()))
        .ok_or_else(|| format!("time without a date '{dt}'"))?
        .ok_or_else(|| format!("invalid date '{dt}'"))?;

    match dt.time {
        None => Ok(SqlValue::Date(date)),
        Some(t) => NaiveTime::from_hms_nano_opt(
            t.hour.into(),
            t.minute.into(),
            t.second.into(),
            t.nanosecond,
        )
        .map(|time| SqlValue::Timestamp(NaiveDateTime::new(date, time)))
        .ok_or_else(|| format!("invalid time '{dt}'")),
    }
}
