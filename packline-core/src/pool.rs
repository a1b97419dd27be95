//! Database connection pool management
//!
//! [`DbPool`] wraps a sqlx pool for whichever backend the database URL
//! names. It is built once at startup, passed explicitly to whatever needs
//! it, and closed at shutdown.
//!
//! Statements are sent as written, so placeholders must match the backend
//! (`$1` for PostgreSQL, `?` for MySQL and SQLite).

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlTransactionManager};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, PgTransactionManager, Postgres};
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteTransactionManager};
use sqlx::types::BigDecimal;
use sqlx::{Column, Executor, Row, TransactionManager, TypeInfo, ValueRef};
use tracing::{info, trace, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::connection::{ConnectionSource, Release, StoreConnection};
use crate::error::StoreError;
use crate::operation::{Operation, Record, SqlValue};

macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for value in $params {
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Bool(v) => query.bind(*v),
                SqlValue::Int(v) => query.bind(*v),
                SqlValue::Float(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.as_str()),
                SqlValue::Date(v) => query.bind(*v),
                SqlValue::Timestamp(v) => query.bind(*v),
            };
        }
        query
    }};
}

/// Backend implied by a database URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    MySql,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            "mysql" | "mariadb" => Ok(Backend::MySql),
            "sqlite" => Ok(Backend::Sqlite),
            _ => Err(StoreError::UnsupportedScheme(redact_url(url))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Postgres => "postgres",
            Backend::MySql => "mysql",
            Backend::Sqlite => "sqlite",
        })
    }
}

/// Strip credentials from a URL before it reaches logs or errors.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Shared, cloneable connection pool.
#[derive(Debug, Clone)]
pub enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

macro_rules! build_pool {
    ($options:ty, $config:expr) => {
        <$options>::new()
            .max_connections($config.max_connections)
            .min_connections($config.min_connections)
            .acquire_timeout($config.acquire_timeout())
            .idle_timeout($config.idle_timeout())
            .max_lifetime($config.max_lifetime())
            .connect(&$config.url)
            .await?
    };
}

impl DbPool {
    /// Open a pool according to `config`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown URL scheme or if the first connection cannot be
    /// established.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let backend = Backend::from_url(&config.url)?;
        let pool = match backend {
            Backend::Postgres => DbPool::Postgres(build_pool!(PgPoolOptions, config)),
            Backend::MySql => DbPool::MySql(build_pool!(MySqlPoolOptions, config)),
            Backend::Sqlite => DbPool::Sqlite(build_pool!(SqlitePoolOptions, config)),
        };

        info!(
            %backend,
            url = %redact_url(&config.url),
            max_connections = config.max_connections,
            "database pool ready"
        );
        Ok(pool)
    }

    pub fn from_postgres(pool: PgPool) -> Self {
        DbPool::Postgres(pool)
    }

    pub fn from_mysql(pool: MySqlPool) -> Self {
        DbPool::MySql(pool)
    }

    pub fn from_sqlite(pool: SqlitePool) -> Self {
        DbPool::Sqlite(pool)
    }

    pub fn backend(&self) -> Backend {
        match self {
            DbPool::Postgres(_) => Backend::Postgres,
            DbPool::MySql(_) => Backend::MySql,
            DbPool::Sqlite(_) => Backend::Sqlite,
        }
    }

    /// Connections currently open, idle or checked out.
    pub fn size(&self) -> u32 {
        match self {
            DbPool::Postgres(pool) => pool.size(),
            DbPool::MySql(pool) => pool.size(),
            DbPool::Sqlite(pool) => pool.size(),
        }
    }

    pub fn idle(&self) -> usize {
        match self {
            DbPool::Postgres(pool) => pool.num_idle(),
            DbPool::MySql(pool) => pool.num_idle(),
            DbPool::Sqlite(pool) => pool.num_idle(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            DbPool::Postgres(pool) => pool.is_closed(),
            DbPool::MySql(pool) => pool.is_closed(),
            DbPool::Sqlite(pool) => pool.is_closed(),
        }
    }

    /// Round-trip `SELECT 1`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            DbPool::Postgres(pool) => pool.execute("SELECT 1").await.map(drop)?,
            DbPool::MySql(pool) => pool.execute("SELECT 1").await.map(drop)?,
            DbPool::Sqlite(pool) => pool.execute("SELECT 1").await.map(drop)?,
        }
        Ok(())
    }

    /// Run one read query outside any transaction.
    ///
    /// A connection is checked out for the duration of the query only.
    pub async fn fetch_all(&self, operation: &Operation) -> Result<Vec<Record>, StoreError> {
        trace!(label = operation.label(), "fetch_all");
        let records = match self {
            DbPool::Postgres(pool) => bind_params!(sqlx::query(operation.sql()), operation.params())
                .fetch_all(pool)
                .await?
                .iter()
                .map(pg_record)
                .collect::<Result<Vec<_>, _>>()?,
            DbPool::MySql(pool) => bind_params!(sqlx::query(operation.sql()), operation.params())
                .fetch_all(pool)
                .await?
                .iter()
                .map(mysql_record)
                .collect::<Result<Vec<_>, _>>()?,
            DbPool::Sqlite(pool) => bind_params!(sqlx::query(operation.sql()), operation.params())
                .fetch_all(pool)
                .await?
                .iter()
                .map(sqlite_record)
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(records)
    }

    /// Stop handing out connections and wait for checked-out ones to return.
    pub async fn close(&self) {
        match self {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
        info!(backend = %self.backend(), "database pool closed");
    }
}

#[async_trait]
impl ConnectionSource for DbPool {
    type Connection = DbConnection;

    async fn acquire(&self) -> Result<DbConnection, StoreError> {
        let inner = match self {
            DbPool::Postgres(pool) => Inner::Postgres(pool.acquire().await?),
            DbPool::MySql(pool) => Inner::MySql(pool.acquire().await?),
            DbPool::Sqlite(pool) => Inner::Sqlite(pool.acquire().await?),
        };
        Ok(DbConnection::new(inner))
    }
}

enum Inner {
    Postgres(PoolConnection<Postgres>),
    MySql(PoolConnection<MySql>),
    Sqlite(PoolConnection<Sqlite>),
}

// Transaction control goes through sqlx's own transaction managers so the
// driver tracks depth exactly as it does for `Pool::begin`.
impl Inner {
    async fn begin(&mut self) -> Result<(), StoreError> {
        match self {
            Inner::Postgres(conn) => PgTransactionManager::begin(&mut **conn, None).await?,
            Inner::MySql(conn) => MySqlTransactionManager::begin(&mut **conn, None).await?,
            Inner::Sqlite(conn) => SqliteTransactionManager::begin(&mut **conn, None).await?,
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        match self {
            Inner::Postgres(conn) => PgTransactionManager::commit(&mut **conn).await?,
            Inner::MySql(conn) => MySqlTransactionManager::commit(&mut **conn).await?,
            Inner::Sqlite(conn) => SqliteTransactionManager::commit(&mut **conn).await?,
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self {
            Inner::Postgres(conn) => PgTransactionManager::rollback(&mut **conn).await?,
            Inner::MySql(conn) => MySqlTransactionManager::rollback(&mut **conn).await?,
            Inner::Sqlite(conn) => SqliteTransactionManager::rollback(&mut **conn).await?,
        }
        Ok(())
    }

    /// Queue a ROLLBACK that runs before the connection's next use.
    fn start_rollback(&mut self) {
        match self {
            Inner::Postgres(conn) => PgTransactionManager::start_rollback(&mut **conn),
            Inner::MySql(conn) => MySqlTransactionManager::start_rollback(&mut **conn),
            Inner::Sqlite(conn) => SqliteTransactionManager::start_rollback(&mut **conn),
        }
    }

    fn transaction_depth(&self) -> usize {
        match self {
            Inner::Postgres(conn) => PgTransactionManager::get_transaction_depth(&**conn),
            Inner::MySql(conn) => MySqlTransactionManager::get_transaction_depth(&**conn),
            Inner::Sqlite(conn) => SqliteTransactionManager::get_transaction_depth(&**conn),
        }
    }

    async fn execute(&mut self, operation: &Operation) -> Result<u64, StoreError> {
        let rows = match self {
            Inner::Postgres(conn) => {
                bind_params!(sqlx::query(operation.sql()), operation.params())
                    .execute(&mut **conn)
                    .await?
                    .rows_affected()
            }
            Inner::MySql(conn) => {
                bind_params!(sqlx::query(operation.sql()), operation.params())
                    .execute(&mut **conn)
                    .await?
                    .rows_affected()
            }
            Inner::Sqlite(conn) => {
                bind_params!(sqlx::query(operation.sql()), operation.params())
                    .execute(&mut **conn)
                    .await?
                    .rows_affected()
            }
        };
        Ok(rows)
    }

    async fn close(self) -> Result<(), StoreError> {
        match self {
            Inner::Postgres(conn) => conn.close().await?,
            Inner::MySql(conn) => conn.close().await?,
            Inner::Sqlite(conn) => conn.close().await?,
        }
        Ok(())
    }
}

/// A pooled connection checked out by the pipeline.
///
/// If this is dropped while a transaction is open (the owning future was
/// cancelled mid-statement), a ROLLBACK is queued before the connection
/// goes back to the pool, the same way a dropped `sqlx::Transaction` does.
pub struct DbConnection {
    inner: Option<Inner>,
}

impl DbConnection {
    fn new(inner: Inner) -> Self {
        Self { inner: Some(inner) }
    }

    fn live(&mut self) -> Result<&mut Inner, StoreError> {
        self.inner
            .as_mut()
            .ok_or(StoreError::Unusable("connection already released"))
    }

    pub fn in_transaction(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.transaction_depth() > 0)
    }
}

#[async_trait]
impl StoreConnection for DbConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.in_transaction() {
            return Err(StoreError::Unusable("transaction already open"));
        }
        self.live()?.begin().await
    }

    async fn execute(&mut self, operation: &Operation) -> Result<u64, StoreError> {
        if !self.in_transaction() {
            return Err(StoreError::Unusable("no open transaction"));
        }
        self.live()?.execute(operation).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction() {
            return Err(StoreError::Unusable("no open transaction"));
        }
        self.live()?.commit().await
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.live()?.rollback().await
    }

    async fn release(mut self, disposition: Release) -> Result<(), StoreError> {
        let dirty = self.in_transaction();
        let inner = self
            .inner
            .take()
            .ok_or(StoreError::Unusable("connection already released"))?;

        if disposition == Release::Discard || dirty {
            inner.close().await
        } else {
            drop(inner);
            Ok(())
        }
    }
}

impl Drop for DbConnection {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            if inner.transaction_depth() > 0 {
                warn!("connection dropped inside an open transaction, queueing rollback");
                inner.start_rollback();
            }
        }
    }
}

// Try each Rust type in order until one is compatible with the column. A
// NULL decodes as `None` for the first attempt. A value no attempt can
// represent is an error, never a silent NULL.
macro_rules! decode_column {
    ($row:expr, $index:expr; $($ty:ty => $map:expr),+ $(,)?) => {{
        let row = $row;
        let index: usize = $index;
        let mut value: Option<SqlValue> = None;
        $(
            if value.is_none() {
                match row.try_get::<Option<$ty>, _>(index) {
                    Ok(None) => value = Some(SqlValue::Null),
                    Ok(Some(v)) => value = ($map)(v),
                    Err(_) => {}
                }
            }
        )+
        match value {
            Some(value) => Ok(value),
            None if row.try_get_raw(index)?.is_null() => Ok(SqlValue::Null),
            None => {
                let column = &row.columns()[index];
                trace!(column = column.name(), "no decoder for column value");
                Err(StoreError::Undecodable {
                    column: column.name().to_string(),
                    type_name: column.type_info().name().to_string(),
                })
            }
        }
    }};
}

macro_rules! record_decoder {
    ($name:ident, $row:ty; $($attempts:tt)+) => {
        fn $name(row: &$row) -> Result<Record, StoreError> {
            let mut record = Record::new();
            for (index, column) in row.columns().iter().enumerate() {
                let value: Result<SqlValue, StoreError> =
                    decode_column!(row, index; $($attempts)+);
                record.push(column.name(), value?);
            }
            Ok(record)
        }
    };
}

fn unsigned(v: u64) -> SqlValue {
    i64::try_from(v)
        .map(SqlValue::Int)
        .unwrap_or_else(|_| SqlValue::Text(v.to_string()))
}

record_decoder!(pg_record, PgRow;
    i64 => |v: i64| Some(SqlValue::Int(v)),
    i32 => |v: i32| Some(SqlValue::Int(v.into())),
    i16 => |v: i16| Some(SqlValue::Int(v.into())),
    f64 => |v: f64| Some(SqlValue::Float(v)),
    f32 => |v: f32| Some(SqlValue::Float(v.into())),
    bool => |v: bool| Some(SqlValue::Bool(v)),
    String => |v: String| Some(SqlValue::Text(v)),
    BigDecimal => |v: BigDecimal| Some(SqlValue::Text(v.to_string())),
    NaiveDateTime => |v: NaiveDateTime| Some(SqlValue::Timestamp(v)),
    DateTime<Utc> => |v: DateTime<Utc>| Some(SqlValue::Timestamp(v.naive_utc())),
    NaiveDate => |v: NaiveDate| Some(SqlValue::Date(v)),
    NaiveTime => |v: NaiveTime| Some(SqlValue::Text(v.to_string())),
    Uuid => |v: Uuid| Some(SqlValue::Text(v.to_string())),
    Vec<u8> => |v: Vec<u8>| String::from_utf8(v).ok().map(SqlValue::Text),
);

// MySQL reports UNSIGNED ints, DECIMAL (including SUM of ints) and
// *_bin collated text as distinct types.
record_decoder!(mysql_record, MySqlRow;
    i64 => |v: i64| Some(SqlValue::Int(v)),
    u64 => |v: u64| Some(unsigned(v)),
    f64 => |v: f64| Some(SqlValue::Float(v)),
    String => |v: String| Some(SqlValue::Text(v)),
    BigDecimal => |v: BigDecimal| Some(SqlValue::Text(v.to_string())),
    NaiveDateTime => |v: NaiveDateTime| Some(SqlValue::Timestamp(v)),
    DateTime<Utc> => |v: DateTime<Utc>| Some(SqlValue::Timestamp(v.naive_utc())),
    NaiveDate => |v: NaiveDate| Some(SqlValue::Date(v)),
    NaiveTime => |v: NaiveTime| Some(SqlValue::Text(v.to_string())),
    Vec<u8> => |v: Vec<u8>| String::from_utf8(v).ok().map(SqlValue::Text),
);

record_decoder!(sqlite_record, SqliteRow;
    i64 => |v: i64| Some(SqlValue::Int(v)),
    f64 => |v: f64| Some(SqlValue::Float(v)),
    bool => |v: bool| Some(SqlValue::Bool(v)),
    String => |v: String| Some(SqlValue::Text(v)),
    NaiveDateTime => |v: NaiveDateTime| Some(SqlValue::Timestamp(v)),
    NaiveDate => |v: NaiveDate| Some(SqlValue::Date(v)),
    Vec<u8> => |v: Vec<u8>| String::from_utf8(v).ok().map(SqlValue::Text),
);
