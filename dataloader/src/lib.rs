//! A concurrent, runtime-agnostic request batcher and de-duplicating loader.
//!
//! A [`DataLoader`] turns many independent point lookups into a few grouped
//! fetches. It is meant for graph-shaped work, where resolving one node fans
//! out into many lookups of related nodes and a naive implementation would
//! issue one query per lookup.
//!
//! # Features
//! - **De-duplication**: concurrent and repeated loads of the same cache key
//!   share a single result cell, so each key is fetched at most once until it
//!   is cleared.
//! - **Quiescence-driven batching**: batches are dispatched by a
//!   [`TickScheduler`] once every task it tracks has parked, so there is no
//!   timer to tune and no explicit "flush" call.
//! - **Two dispatch modes**: `Batched` coalesces keys; `Immediate` fetches
//!   every key on its own while keeping caching and instrumentation.
//! - **Instrumentation**: any number of independent [`Instrumentation`]
//!   observers, each with private per-batch state, isolated from each other's
//!   panics.
//! - **Non-Clone Support**: values are shared as `Arc<V>` and errors as
//!   `Arc<E>`, avoiding `Clone` bounds.
//! - **Observability**: structured `tracing` events and a [`MetricsSnapshot`].
//!
//! # Example
//!
//! ```no_run
//! use fibre_dataloader::{BatchEnvironment, DataLoader};
//!
//! # async fn run() {
//! let loader = DataLoader::builder(|ids: Vec<u64>, _env: BatchEnvironment| async move {
//!   // One round trip for the whole batch.
//!   let users = ids
//!     .into_iter()
//!     .map(|id| Ok::<_, std::io::Error>(format!("user-{id}")))
//!     .collect::<Vec<_>>();
//!   Ok::<_, std::io::Error>(users)
//! })
//! .max_batch_size(100)
//! .build()
//! .unwrap();
//!
//! let scheduler = loader.scheduler().clone();
//! let users = scheduler
//!   .spawn({
//!     let loader = loader.clone();
//!     async move { loader.load_many([1, 2, 3]).await }
//!   })
//!   .await;
//! assert_eq!(users.len(), 3);
//! # }
//! ```

// Public modules that form the API
pub mod batch_fn;
pub mod builder;
pub mod error;
pub mod instrumentation;
pub mod metrics;
pub mod options;
pub mod runtime;
pub mod scheduler;

// Internal, crate-only modules
mod batch;
mod cache;
mod cell;
mod loader;
mod strategy;
mod task;

// Re-export the primary user-facing types for convenience
pub use batch_fn::{BatchEnvironment, BatchFn, DispatchContext, FetchResult, KeyContext};
pub use builder::DataLoaderBuilder;
pub use cache::CacheKeyMatchFn;
pub use cell::{LoadResult, ResultCell};
pub use error::{BuildError, LoadError};
pub use instrumentation::{Instrumentation, LoggingInstrumentation};
pub use loader::{CacheKeyFn, DataLoader};
pub use metrics::MetricsSnapshot;
pub use options::{DispatchMode, LoaderOptions};
pub use runtime::TaskSpawner;
pub use scheduler::{TaskHandle, TickContext, TickMetadata, TickScheduler};

#[cfg(feature = "tokio")]
pub use runtime::TokioSpawner;
