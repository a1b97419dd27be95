//! Operations: a statement descriptor paired with bound parameter values.
//!
//! An [`Operation`] knows nothing about connections. Callers build them up
//! front (inline SQL or a [`Statement`] from the query catalog) and hand
//! the ordered list to the pipeline, which executes each one against the
//! connection it holds.

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Serialize, Serializer};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// A single bind parameter or decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    /// Interpret a command-line literal.
    ///
    /// `null`, `true`/`false`, integers, floats, `YYYY-MM-DD` and
    /// `YYYY-MM-DDTHH:MM:SS[.f]` get their own variants; anything else is
    /// text. Quote-wrapped input (`'42'`) is always text.
    pub fn parse_literal(raw: &str) -> Self {
        let trimmed = raw.trim();

        if let Some(inner) = trimmed
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return SqlValue::Text(inner.to_string());
        }

        match trimmed {
            "null" | "NULL" => return SqlValue::Null,
            "true" => return SqlValue::Bool(true),
            "false" => return SqlValue::Bool(false),
            _ => {}
        }

        if let Ok(n) = trimmed.parse::<i64>() {
            return SqlValue::Int(n);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return SqlValue::Float(f);
            }
        }
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
            return SqlValue::Date(d);
        }
        if let Some(ts) = parse_timestamp(trimmed) {
            return SqlValue::Timestamp(ts);
        }

        SqlValue::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{v}"),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Text(v) => write!(f, "'{v}'"),
            SqlValue::Date(v) => write!(f, "{}", v.format(DATE_FORMAT)),
            SqlValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S%.f")),
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_none(),
            SqlValue::Bool(v) => serializer.serialize_bool(*v),
            SqlValue::Int(v) => serializer.serialize_i64(*v),
            SqlValue::Float(v) => serializer.serialize_f64(*v),
            SqlValue::Text(v) => serializer.serialize_str(v),
            SqlValue::Date(v) => serializer.collect_str(&v.format(DATE_FORMAT)),
            SqlValue::Timestamp(v) => serializer.collect_str(&v.format("%Y-%m-%dT%H:%M:%S%.f")),
        }
    }
}

macro_rules! impl_from_for_sql_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(v: $ty) -> Self {
                    SqlValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_sql_value! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f64 => Float,
    String => Text,
    NaiveDate => Date,
    NaiveDateTime => Timestamp,
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// SQL text plus the catalog name it was loaded under, if any.
///
/// Clones share the underlying text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    name: Option<Arc<str>>,
    sql: Arc<str>,
}

impl Statement {
    /// An inline statement with no catalog name.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            name: None,
            sql: Arc::from(sql.into()),
        }
    }

    pub fn named(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: Some(Arc::from(name.into())),
            sql: Arc::from(sql.into()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Start an operation from this statement with its first parameter.
    pub fn bind(&self, value: impl Into<SqlValue>) -> Operation {
        Operation::from_statement(self.clone()).bind(value)
    }

    /// An operation with no parameters.
    pub fn operation(&self) -> Operation {
        Operation::from_statement(self.clone())
    }
}

/// A parameterized unit of work for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    statement: Statement,
    params: Vec<SqlValue>,
}

impl Operation {
    pub fn new(sql: impl Into<String>) -> Self {
        Self::from_statement(Statement::new(sql))
    }

    pub fn from_statement(statement: Statement) -> Self {
        Self {
            statement,
            params: Vec::new(),
        }
    }

    /// Append the next positional parameter.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn bind_all<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.params.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn sql(&self) -> &str {
        self.statement.sql()
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// Catalog name, or `inline` for ad hoc SQL. Used in logs and errors.
    pub fn label(&self) -> &str {
        self.statement.name().unwrap_or("inline")
    }
}

/// One row returned by a read query, columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, SqlValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: SqlValue) {
        self.columns.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
