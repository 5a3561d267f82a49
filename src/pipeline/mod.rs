//! Pipeline execution -- one input file enriched into one output file.
//!
//! Split into focused submodules:
//! - [`results`] - Ordinal-indexed results buffer
//! - [`context`] - Shared state for a single run
//! - [`orchestration`] - Top-level run lifecycle (`run` / `resume`)
//! - [`worker_pool`] - Bounded-concurrency row dispatch and periodic checkpoints
//! - [`finalization`] - Output writing, checkpoint cleanup and abort handling

mod context;
mod finalization;
mod orchestration;
mod results;
mod worker_pool;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::enrich::Enricher;
use crate::error::Result;
use crate::rate_limiter::RateLimiter;
use crate::types::{Event, PipelineState};

/// Capacity of the progress event channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// A single enrichment run over one input file
///
/// Rows are streamed from the input, enriched by at most
/// `workers.concurrency` concurrent calls through one shared [`RateLimiter`],
/// and written to the output in input order once every row has reached a
/// terminal state. Progress is checkpointed every `checkpoint.interval`
/// completions so an interrupted run can be picked up with
/// [`Pipeline::resume`].
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use batch_enrich::{Config, HttpEnricher, Pipeline};
///
/// # async fn example() -> batch_enrich::Result<()> {
/// let config = Config::from_file(Path::new("enrich.json"))?;
/// let provider = config.provider.clone().ok_or_else(|| {
///     batch_enrich::Error::Other("no provider configured".into())
/// })?;
/// let enricher = Arc::new(HttpEnricher::from_config(&provider)?);
///
/// let pipeline = Pipeline::new(config, enricher)?;
/// let summary = pipeline
///     .run(Path::new("leads.csv"), Path::new("leads.enriched.csv"))
///     .await?;
/// println!("{} rows, {} errors", summary.total, summary.error);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: Arc<Config>,
    enricher: Arc<dyn Enricher>,
    limiter: RateLimiter,
    cancel_token: CancellationToken,
    event_tx: broadcast::Sender<Event>,
    state: watch::Sender<PipelineState>,
    shard: Option<usize>,
    checkpoint_location: Option<(PathBuf, String)>,
    retain_checkpoints: bool,
}

impl Pipeline {
    /// Create a pipeline from a validated configuration
    pub fn new(config: Config, enricher: Arc<dyn Enricher>) -> Result<Self> {
        config.validate()?;
        let limiter = RateLimiter::from_config(&config.rate_limit, config.workers.concurrency);
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _rx) = watch::channel(PipelineState::Idle);

        Ok(Self {
            config: Arc::new(config),
            enricher,
            limiter,
            cancel_token: CancellationToken::new(),
            event_tx,
            state,
            shard: None,
            checkpoint_location: None,
            retain_checkpoints: false,
        })
    }

    /// Use an externally owned cancellation token (e.g. a child of a signal handler's token)
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Publish events on an existing channel instead of a private one
    pub fn with_event_sender(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = event_tx;
        self
    }

    /// Tag events and log lines with a shard index
    pub fn with_shard(mut self, shard: usize) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Write checkpoints as `<dir>/<stem>_backup_<N>.csv`
    ///
    /// Overrides `checkpoint.directory` and the default stem derived from the
    /// output file name.
    pub fn with_checkpoint_location(mut self, dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        self.checkpoint_location = Some((dir.into(), stem.into()));
        self
    }

    /// Keep checkpoints after a successful run, ending with one that covers every row
    ///
    /// Used when the output is only an intermediate artifact: the run can be
    /// resumed without any calls until the caller has consumed the output and
    /// removed the checkpoints itself.
    pub fn retain_checkpoints(mut self) -> Self {
        self.retain_checkpoints = true;
        self
    }

    /// Share a rate limiter with other pipelines
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Subscribe to progress events
    ///
    /// Events are informational: a receiver that falls behind observes
    /// `RecvError::Lagged` and the run never waits for it.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Token that stops the run when cancelled
    ///
    /// Cancelling stops new rows from being claimed and rows waiting for a
    /// rate-limiter slot are left pending. Calls already dispatched finish
    /// and are recorded, then a final checkpoint is written and the run
    /// returns [`Error::Aborted`](crate::Error::Aborted).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// The limiter every call of this pipeline goes through
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The configuration this pipeline runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("enricher", &self.enricher.name())
            .field("limiter", &self.limiter)
            .field("shard", &self.shard)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
