//! # Search Sync Engine
//!
//! Incremental, pull-based change capture from Postgres into an
//! Elasticsearch index.
//!
//! ## Architecture
//!
//! The engine polls the source for rows modified past a persisted watermark,
//! fans leaf changes out to the film works that embed them, materializes
//! denormalized documents and bulk-upserts them:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          search-sync-engine                              │
//! │                                                                          │
//! │  ┌──────────────┐   ┌───────────────────┐   ┌──────────┐   ┌──────────┐  │
//! │  │ ChangeScanner│──►│DependencyResolver │──►│ Enricher │──►│SearchSink│  │
//! │  │ (range scan) │   │ (leaf → film_work)│   │ (project)│   │ (_bulk)  │  │
//! │  └──────────────┘   └───────────────────┘   └──────────┘   └──────────┘  │
//! │         ▲                                                       │        │
//! │         │               all written? advance                    │        │
//! │  ┌──────────────┐◄──────────────────────────────────────────────┘        │
//! │  │WatermarkStore│                                                        │
//! │  │ (JSON file)  │                                                        │
//! │  └──────────────┘                                                        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! At-least-once. A watermark only moves past a page once every document
//! derived from it was reported written; anything else is re-delivered on the
//! next sweep and absorbed by the idempotent upsert.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use search_sync_engine::{ElasticsearchSink, PgSource, SyncConfig, SyncEngine, WatermarkStore};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> search_sync_engine::Result<()> {
//!     let config = SyncConfig::load("search-sync.toml")?;
//!     let source = Arc::new(PgSource::connect(&config.source, &config.tracked).await?);
//!     let sink = Arc::new(ElasticsearchSink::new(&config.sink, config.settings.retry.clone())?);
//!     let watermarks = WatermarkStore::open_file(&config.watermark.path);
//!
//!     let engine = SyncEngine::new(config, source, sink, watermarks);
//!     let (_tx, shutdown_rx) = watch::channel(false);
//!     engine.run(shutdown_rx).await
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod document;
pub mod enrich;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod resilience;
pub mod scanner;
pub mod sink;
pub mod source;
pub mod watermark;

use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Boxed stream of fallible rows, read lazily from an open query.
pub type RowStream<'a, T> = futures::stream::BoxStream<'a, Result<T>>;

// Re-exports for convenience
pub use config::{LinkSpec, SyncConfig, SyncSettings, TrackedEntity};
pub use coordinator::{EngineState, EntityReport, SweepReport, SyncEngine};
pub use document::{FilmWorkDocument, FilmWorkRow, PersonRef, PersonRole};
pub use enrich::LoadReport;
pub use error::{Result, SyncError};
pub use resilience::RetryConfig;
pub use sink::{ElasticsearchSink, SearchSink};
pub use source::{ChangeRecord, PgSource, SourceDatabase};
pub use watermark::{WatermarkStore, WatermarkToken};
