//! The seam between the pipeline and the backing store.
//!
//! [`crate::pool::DbPool`] implements these over sqlx; tests implement them
//! with scripted fakes to inject failures at each pipeline stage.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::operation::Operation;

/// How a connection should leave the pipeline's hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Transaction state is clean; return it to the pool.
    Reuse,
    /// Rollback failed or state is unknown; close it instead.
    Discard,
}

/// Something connections can be checked out of.
///
/// Implementations must hand out each connection to at most one caller at a
/// time and enforce their own acquire timeout.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    type Connection: StoreConnection;

    async fn acquire(&self) -> Result<Self::Connection, StoreError>;
}

/// An exclusively held connection.
///
/// `release` consumes the handle so it can only happen once.
#[async_trait]
pub trait StoreConnection: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;

    /// Run one write; returns rows affected.
    async fn execute(&mut self, operation: &Operation) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    async fn release(self, disposition: Release) -> Result<(), StoreError>
    where
        Self: Sized;
}

#[async_trait]
impl<T> ConnectionSource for std::sync::Arc<T>
where
    T: ConnectionSource + ?Sized,
{
    type Connection = T::Connection;

    async fn acquire(&self) -> Result<Self::Connection, StoreError> {
        (**self).acquire().await
    }
}
