//! Multi-credential sharding
//!
//! The input is cut into contiguous slices, one per credential, and every
//! slice is enriched by its own [`Pipeline`] with its own enricher, rate
//! limiter and cancellation token. Shard outputs are concatenated in shard
//! order, which reconstructs the input order.
//!
//! Slices and shard outputs live in a temporary workspace next to the output
//! that is removed on every exit path. Shard checkpoints are written to the
//! checkpoint directory instead (`<stem>_shard<i>_backup_<N>.csv`) so they
//! survive a failed run and can be resumed. A shard that completes keeps a
//! checkpoint covering all of its rows until the merged output is written,
//! so resuming a failed sharded run makes no calls for finished shards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::enrich::EnricherFactory;
use crate::error::{Error, Result, ShardError, ShardFailure};
use crate::output::{OutputSchema, concat_outputs};
use crate::pipeline::Pipeline;
use crate::source::{RowSource, write_slices};
use crate::types::{Event, RunSummary};
use crate::utils::{blocking_io, file_stem, parent_dir};

/// Capacity of the orchestrator's event channel, shared by every shard
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// A contiguous slice of the input assigned to one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    /// Shard index, which is also the credential index
    pub index: usize,
    /// Ordinal of the first row in the slice
    pub start: usize,
    /// Rows in the slice
    pub len: usize,
}

impl ShardPlan {
    /// Ordinal one past the last row in the slice
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Split `total` rows into at most `shards` contiguous slices of `ceil(total / shards)` rows
///
/// The last slice takes the remainder. Slices that would be empty (fewer
/// rows than shards) are not planned at all.
///
/// # Examples
///
/// ```
/// use batch_enrich::orchestrator::plan_shards;
///
/// let plans = plan_shards(10, 3);
/// let lens: Vec<usize> = plans.iter().map(|p| p.len).collect();
/// assert_eq!(lens, vec![4, 4, 2]);
///
/// assert_eq!(plan_shards(2, 4).len(), 2);
/// ```
pub fn plan_shards(total: usize, shards: usize) -> Vec<ShardPlan> {
    if shards == 0 || total == 0 {
        return Vec::new();
    }
    let size = total.div_ceil(shards);
    (0..shards)
        .map(|index| {
            let start = (index * size).min(total);
            let end = (start + size).min(total);
            ShardPlan {
                index,
                start,
                len: end - start,
            }
        })
        .filter(|plan| plan.len > 0)
        .collect()
}

/// Runs one pipeline per credential over disjoint slices of the input
pub struct Orchestrator {
    config: Config,
    factory: Arc<dyn EnricherFactory>,
    cancel_token: CancellationToken,
    event_tx: broadcast::Sender<Event>,
}

impl Orchestrator {
    /// Create an orchestrator sharding over `config.sharding.credentials`
    pub fn new(config: Config, factory: Arc<dyn EnricherFactory>) -> Result<Self> {
        config.validate()?;
        if config.sharding.credentials.is_empty() {
            return Err(ShardError::NoCredentials.into());
        }
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            factory,
            cancel_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Subscribe to events from the orchestrator and every shard
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Token that cancels every shard
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Shard `input`, enrich every slice and write the merged result to `output`
    pub async fn run(&self, input: &Path, output: &Path) -> Result<RunSummary> {
        self.execute(input, output, false).await
    }

    /// Like [`Orchestrator::run`], but every shard resumes from its own checkpoint
    ///
    /// The input and the number of credentials must be unchanged since the
    /// interrupted run, otherwise slices no longer line up with checkpoints.
    pub async fn resume(&self, input: &Path, output: &Path) -> Result<RunSummary> {
        self.execute(input, output, true).await
    }

    async fn execute(&self, input: &Path, output: &Path, resume: bool) -> Result<RunSummary> {
        let started_at = Utc::now();
        let config = &self.config;
        let credentials = &config.sharding.credentials;

        // Size and plan
        let (headers, total) = {
            let input = input.to_path_buf();
            let source_config = config.source.clone();
            blocking_io(move || {
                let counting = RowSource::open(&input, &source_config)?;
                let headers = Arc::clone(counting.headers());
                Ok((headers, counting.count_rows()?))
            })
            .await?
        };
        let plans = plan_shards(total, credentials.len());
        tracing::info!(
            input = %input.display(),
            total,
            shards = plans.len(),
            credentials = credentials.len(),
            "sharding input"
        );

        let schema = OutputSchema::new(&headers, &config.output)
            .with_delimiter(config.source.delimiter as u8);
        let filter = config
            .output
            .filter
            .as_ref()
            .map(|f| schema.compile_filter(f))
            .transpose()?;

        // Scoped workspace, removed when dropped on every path below
        let workspace_parent = config
            .sharding
            .workspace_dir
            .clone()
            .unwrap_or_else(|| parent_dir(output));
        std::fs::create_dir_all(&workspace_parent)?;
        let workspace = tempfile::Builder::new()
            .prefix(".shards-")
            .tempdir_in(&workspace_parent)?;

        let slices = {
            let input = input.to_path_buf();
            let source_config = config.source.clone();
            let plans = plans.clone();
            let dir = workspace.path().to_path_buf();
            blocking_io(move || write_slices(RowSource::open(&input, &source_config)?, &plans, &dir)).await?
        };

        // Launch
        let checkpoint_dir = shard_checkpoint_dir(config, output);
        let siblings = self.cancel_token.child_token();

        let mut shard_config = config.clone();
        shard_config.output.filter = None;

        // Every shard is built before any is spawned, so a bad credential
        // fails the run without leaving tasks behind.
        let mut prepared = Vec::with_capacity(plans.len());
        for (plan, slice) in plans.iter().zip(slices) {
            let enricher = self.factory.build(&credentials[plan.index])?;
            let pipeline = Pipeline::new(shard_config.clone(), enricher)?
                .with_shard(plan.index)
                .with_event_sender(self.event_tx.clone())
                .with_cancel_token(siblings.child_token())
                .with_checkpoint_location(&checkpoint_dir, shard_stem(output, plan.index))
                .retain_checkpoints();
            prepared.push((*plan, slice, pipeline));
        }

        let mut launched = Vec::with_capacity(prepared.len());
        for (plan, slice, pipeline) in prepared {
            let shard_output = workspace.path().join(format!("output_{}.csv", plan.index));

            self.event_tx
                .send(Event::ShardStarted {
                    shard: plan.index,
                    rows: plan.len,
                })
                .ok();
            tracing::info!(
                shard = plan.index,
                credential = %credentials[plan.index].name,
                start = plan.start,
                rows = plan.len,
                "shard started"
            );

            let cancel_siblings = config.sharding.cancel_siblings_on_failure;
            let siblings = siblings.clone();
            let handle = tokio::spawn(async move {
                let outcome = if resume {
                    pipeline.resume(&slice, &shard_output).await
                } else {
                    pipeline.run(&slice, &shard_output).await
                };
                if outcome.is_err() && cancel_siblings {
                    siblings.cancel();
                }
                outcome.map(|summary| (summary, shard_output))
            });
            launched.push((plan, handle));
        }

        // Join in shard order; every shard settles before anything is reported
        let mut summaries = Vec::with_capacity(launched.len());
        let mut parts = Vec::with_capacity(launched.len());
        let mut failures = Vec::new();
        for (plan, handle) in launched {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Other(format!("shard task failed: {e}"))),
            };
            let ok = outcome.is_ok();
            match outcome {
                Ok((summary, part)) => {
                    tracing::info!(
                        shard = plan.index,
                        success = summary.success,
                        classified_failure = summary.classified_failure,
                        error = summary.error,
                        "shard completed"
                    );
                    summaries.push(summary);
                    parts.push(part);
                }
                Err(e) => {
                    tracing::error!(shard = plan.index, error = %e, "shard failed");
                    failures.push(ShardFailure {
                        shard: plan.index,
                        message: e.to_string(),
                    });
                }
            }
            self.event_tx
                .send(Event::ShardFinished {
                    shard: plan.index,
                    ok,
                })
                .ok();
        }

        if !failures.is_empty() {
            return Err(ShardError::Failed {
                failures,
                total: plans.len(),
            }
            .into());
        }

        // Merge
        let stats = {
            let output = output.to_path_buf();
            blocking_io(move || concat_outputs(&parts, &output, &schema, filter.as_ref())).await?
        };
        for plan in &plans {
            CheckpointManager::new(&config.checkpoint, checkpoint_dir.clone(), shard_stem(output, plan.index))
                .clear();
        }
        let workspace_path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            tracing::warn!(path = %workspace_path.display(), error = %e, "failed to remove shard workspace");
        }

        let summary = RunSummary::merge(output.to_path_buf(), stats.written, started_at, &summaries);
        self.event_tx
            .send(Event::Completed {
                total: summary.total,
                success: summary.success,
                classified_failure: summary.classified_failure,
                error: summary.error,
                shard: None,
            })
            .ok();
        tracing::info!(
            output = %output.display(),
            total = summary.total,
            shards = summaries.len(),
            written = stats.written,
            filtered = stats.filtered,
            "sharded run completed"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("credentials", &self.config.sharding.credentials)
            .field("cancel_siblings_on_failure", &self.config.sharding.cancel_siblings_on_failure)
            .finish_non_exhaustive()
    }
}

/// Shard checkpoint stem for `output`, as used by [`Orchestrator`]
pub fn shard_stem(output: &Path, shard: usize) -> String {
    format!("{}_shard{shard}", file_stem(output))
}

/// Directory a sharded run writes its shard checkpoints to
pub fn shard_checkpoint_dir(config: &Config, output: &Path) -> PathBuf {
    config
        .checkpoint
        .directory
        .clone()
        .unwrap_or_else(|| parent_dir(output))
}
