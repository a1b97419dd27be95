//! Structured error types for the storage layer and the write pipeline.
//!
//! Library callers get `thiserror` enums with source chains; the
//! `packline` binary wraps them in `anyhow` for reporting.
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::PipelineState;

/// Failure reported by a connection source or a live connection.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The pool's acquire timeout elapsed with every connection checked out
    #[error("timed out waiting for a pooled connection")]
    PoolTimedOut,

    /// The pool was closed before or during acquisition
    #[error("connection pool is closed")]
    PoolClosed,

    /// A statement exceeded the configured per-statement deadline
    #[error("statement timed out after {0:?}")]
    TimedOut(Duration),

    /// Database URL has a scheme no backend is compiled for
    #[error("unsupported database url scheme in '{0}'")]
    UnsupportedScheme(String),

    /// Connection was used after it left its transaction or was released
    #[error("connection is no longer usable: {0}")]
    Unusable(&'static str),

    /// A result column held a value no supported Rust type can represent
    #[error("column '{column}' has type {type_name} that cannot be decoded")]
    Undecodable { column: String, type_name: String },

    /// Driver-level failure (I/O, protocol, constraint violation, ...)
    #[error("database error: {0}")]
    Sqlx(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::PoolTimedOut,
            sqlx::Error::PoolClosed => StoreError::PoolClosed,
            other => StoreError::Sqlx(other),
        }
    }
}

impl StoreError {
    /// Build a driver error from a plain message.
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Sqlx(sqlx::Error::Protocol(message.into()))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::PoolTimedOut | StoreError::TimedOut(_))
    }
}

/// Terminal outcome of a failed pipeline invocation.
///
/// Each variant corresponds to one failure edge of the pipeline state
/// machine; nothing here has been retried.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invoked with zero operations; the pool was never touched
    #[error("pipeline invoked with an empty operation list")]
    EmptyOperationList,

    /// No connection became available within the pool's acquire timeout
    #[error("connection pool exhausted: {source}")]
    PoolExhausted {
        #[source]
        source: StoreError,
    },

    /// Acquisition failed for a reason other than exhaustion
    #[error("failed to acquire a connection: {source}")]
    ConnectionError {
        #[source]
        source: StoreError,
    },

    /// BEGIN was rejected; the connection has been released
    #[error("failed to start transaction: {source}")]
    TransactionStartError {
        #[source]
        source: StoreError,
    },

    /// The operation at `index` failed; the transaction was rolled back
    #[error("operation {index} ({label}) failed: {source}")]
    OperationFailed {
        index: usize,
        label: String,
        #[source]
        source: StoreError,
    },

    /// Every operation succeeded but COMMIT failed; rolled back
    #[error("commit failed: {source}")]
    CommitFailed {
        #[source]
        source: StoreError,
    },

    /// Cancelled by the caller before operation `index` completed.
    /// `state` is `AcquireFailed` when no connection was held yet.
    #[error("pipeline cancelled at operation {index}")]
    Cancelled { index: usize, state: PipelineState },
}

impl PipelineError {
    /// Index of the failing operation, when one was running.
    pub fn operation_index(&self) -> Option<usize> {
        match self {
            PipelineError::OperationFailed { index, .. } => Some(*index),
            PipelineError::Cancelled { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Terminal state the invocation ended in.
    pub fn state(&self) -> PipelineState {
        match self {
            PipelineError::EmptyOperationList
            | PipelineError::PoolExhausted { .. }
            | PipelineError::ConnectionError { .. } => PipelineState::AcquireFailed,
            PipelineError::TransactionStartError { .. } => PipelineState::BeginFailed,
            PipelineError::OperationFailed { .. } | PipelineError::CommitFailed { .. } => {
                PipelineState::RolledBack
            }
            PipelineError::Cancelled { state, .. } => *state,
        }
    }

    /// Whether re-running the whole invocation might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::PoolExhausted { .. } | PipelineError::Cancelled { .. } => true,
            PipelineError::OperationFailed { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}
