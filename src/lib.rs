//! # batch-enrich
//!
//! Rate-limited, checkpointed enrichment of large CSV datasets.
//!
//! ## Design Philosophy
//!
//! batch-enrich turns N input rows into N classified and augmented output rows
//! by calling an external, rate-limited, fallible provider once per row:
//! - **Order preserving** - Rows complete in any order, output follows input order
//! - **Failure tolerant** - A failing row is recorded as data, never aborts the run
//! - **Interruptible** - Periodic checkpoints let an interrupted run resume without repeating calls
//! - **Pluggable** - The provider is an [`Enricher`]; a generic HTTP/JSON one ships with the crate
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use batch_enrich::{Config, Enricher, Enrichment, EnrichError, Pipeline, Row};
//!
//! struct WebsiteCheck;
//!
//! #[async_trait]
//! impl Enricher for WebsiteCheck {
//!     async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
//!         let site = row.get("Website").unwrap_or_default();
//!         Ok(if site.starts_with("https://") {
//!             Enrichment::success("Secure")
//!         } else {
//!             Enrichment::failure("Insecure")
//!         })
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "website-check"
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::new(Config::default(), Arc::new(WebsiteCheck))?;
//!
//!     // Subscribe to progress events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = pipeline
//!         .run(Path::new("companies.csv"), Path::new("companies.checked.csv"))
//!         .await?;
//!     println!("{} rows written to {}", summary.rows_written, summary.output.display());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Checkpoint (backup) management
pub mod checkpoint;
/// Configuration types
pub mod config;
/// Enrichment functions and the row-processing boundary
pub mod enrich;
/// Error types
pub mod error;
/// Multi-credential sharding
pub mod orchestrator;
/// Output layout, result writing and filtering
pub mod output;
/// Single-input pipeline runs (decomposed into focused submodules)
pub mod pipeline;
/// Global request spacing
pub mod rate_limiter;
/// Retry of transient enrichment failures
pub mod retry;
/// Streaming CSV input
pub mod source;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{
    CheckpointConfig, ClassificationConfig, Config, Credential, MalformedPolicy, OutputConfig,
    OutputFilter, ProviderConfig, RateLimitConfig, RequiredColumn, RetryConfig, ShardingConfig,
    SourceConfig, WorkerConfig,
};
pub use enrich::{
    Enricher, EnricherFactory, Enrichment, HttpEnricher, HttpEnricherFactory, Outcome,
    RowProcessor,
};
pub use error::{CheckpointError, EnrichError, Error, Result, ShardError, ShardFailure};
pub use orchestrator::{Orchestrator, ShardPlan, plan_shards};
pub use pipeline::Pipeline;
pub use rate_limiter::RateLimiter;
pub use source::RowSource;
pub use types::{Event, Headers, Ordinal, PipelineState, Row, RowResult, RunSummary, TerminalState};

use tokio_util::sync::CancellationToken;

/// Cancel `token` when the process receives a termination signal.
///
/// Spawns a background task; the returned handle can be aborted once the
/// run is over. Cancellation is graceful: pipelines stop claiming rows,
/// finish the calls in flight and leave a checkpoint behind.
///
/// On Unix this listens for SIGTERM and SIGINT; elsewhere (or when signal
/// registration fails) it listens for Ctrl+C.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use batch_enrich::{Config, HttpEnricher, Pipeline, cancel_on_signal};
///
/// # async fn example(enricher: Arc<HttpEnricher>) -> batch_enrich::Result<()> {
/// let pipeline = Pipeline::new(Config::default(), enricher)?;
/// let watcher = cancel_on_signal(pipeline.cancel_token());
///
/// let outcome = pipeline.run(Path::new("in.csv"), Path::new("out.csv")).await;
/// watcher.abort();
/// outcome?;
/// # Ok(())
/// # }
/// ```
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = wait_for_signal() => {
                tracing::warn!("stopping: no new rows will be claimed, in-flight calls will finish");
                token.cancel();
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted sandboxes
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (term, int) => {
            for e in [term.err(), int.err()].into_iter().flatten() {
                tracing::warn!(error = %e, "could not register signal handler, falling back to ctrl_c");
            }
            wait_for_ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => {
            tracing::error!(error = %e, "no signal handler available, run can only be stopped by its token");
            std::future::pending::<()>().await;
        }
    }
}
