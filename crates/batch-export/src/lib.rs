//! # batch-export
//!
//! Parameterized export of relational rows to tab-delimited files.
//!
//! An export job reads a filtered projection of a base query page by page,
//! ordered by an ascending sort key, and writes it in committed chunks to a
//! text file. Jobs are launched and observed through the [`JobTracker`],
//! which the HTTP control surface in [`api`] wraps.
//!
//! - **Query resolution** splits a base query and swaps in a caller filter
//! - **Keyset pagination** keeps only the last seen key between pages
//! - **Chunk commits** leave previously committed chunks intact on failure
//! - **Execution records** track every launch, optionally persisted as JSON
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batch_export::{Config, ExecutionStore, JobTracker, SqlSource};
//!
//! #[tokio::main]
//! async fn main() -> batch_export::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let source = Arc::new(SqlSource::connect(&config.source).await?);
//!     let store = Arc::new(ExecutionStore::new());
//!     let tracker = Arc::new(JobTracker::new(&config.batch, source, store)?);
//!     let execution = tracker.launch_and_wait(Some("age > 30"), None).await?;
//!     println!("job {} finished {}", execution.job_id, execution.status);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod query;
pub mod reader;
pub mod source;
pub mod state;
pub mod tracker;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use config::{BatchConfig, Config, OutputConfig, SourceConfig};
pub use error::{ExportError, Result};
pub use pipeline::{ChunkPipeline, JobResult, PipelineConfig};
pub use query::{QueryBuilder, QuerySpec};
pub use reader::PaginatedReader;
pub use source::{PageSource, Row, SqlSource, SqlValue};
pub use state::{BatchStatus, ExecutionStore, ExitStatus, JobExecution, JobListener};
pub use tracker::JobTracker;
pub use writer::{FieldExtractor, OutputTarget, OutputWriter};
