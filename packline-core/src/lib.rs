//! packline-core: storage plumbing for the packline warehouse backend
//!
//! The center of the crate is [`TransactionPipeline`]: hand it an ordered
//! list of [`Operation`]s and it runs them on one pooled connection inside
//! a single transaction, committing all or none.
//!
//! ```ignore
//! let config = PacklineConfig::load(None)?;
//! let pool = DbPool::connect(&config.database).await?;
//! let catalog = QueryCatalog::new(&config.queries.dir);
//!
//! let pipeline = TransactionPipeline::with_options(pool.clone(), config.pipeline.options());
//! pipeline
//!     .execute(&[
//!         catalog.statement("insertOrderStatus")?.bind("A-1001").bind("packed"),
//!         catalog.statement("insertOrderItem")?.bind("A-1001").bind(1).bind("SKU-1"),
//!     ])
//!     .await?;
//!
//! pool.close().await;
//! ```

pub mod batch;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod operation;
pub mod pipeline;
pub mod pool;

pub use batch::{load_batch, parse_batch, BatchError};
pub use catalog::{CatalogError, QueryCatalog};
pub use config::{ConfigError, DatabaseConfig, PacklineConfig, PipelineConfig, QueriesConfig};
pub use connection::{ConnectionSource, Release, StoreConnection};
pub use error::{PipelineError, StoreError};
pub use operation::{Operation, Record, SqlValue, Statement};
pub use pipeline::{PipelineOptions, PipelineState, Receipt, TransactionPipeline};
pub use pool::{Backend, DbConnection, DbPool};

pub use tokio_util::sync::CancellationToken;
