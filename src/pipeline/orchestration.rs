//! Pipeline orchestration -- top-level lifecycle for a single run.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;

use crate::checkpoint::{self, CheckpointManager};
use crate::enrich::RowProcessor;
use crate::error::{CheckpointError, Error, Result};
use crate::output::OutputSchema;
use crate::source::RowSource;
use crate::types::{Event, Headers, PipelineState, RunSummary};
use crate::utils::{blocking_io, file_stem, parent_dir};

use super::Pipeline;
use super::context::{RunContext, RunCounters};
use super::finalization::finalize_run;
use super::results::ResultsBuffer;
use super::worker_pool::dispatch;

impl Pipeline {
    /// Enrich every row of `input` and write the result to `output`
    ///
    /// Checkpoints left by an earlier run for the same output are deleted
    /// first; use [`Pipeline::resume`] to continue from them instead.
    pub async fn run(&self, input: &Path, output: &Path) -> Result<RunSummary> {
        self.execute(input, output, false).await
    }

    /// Continue an interrupted run from its most recent checkpoint
    ///
    /// Rows found in the checkpoint are restored as-is and not enriched
    /// again. When no checkpoint exists this behaves like [`Pipeline::run`].
    pub async fn resume(&self, input: &Path, output: &Path) -> Result<RunSummary> {
        self.execute(input, output, true).await
    }

    /// Phases:
    /// 1. Count the input rows, derive the output layout and create the output directory
    /// 2. Restore a checkpoint when resuming
    /// 3. Stream pending rows through the worker pool
    /// 4. Write the output (or a final checkpoint when the run was interrupted)
    async fn execute(&self, input: &Path, output: &Path, resume: bool) -> Result<RunSummary> {
        let config = Arc::clone(&self.config);
        let started_at = Utc::now();

        // Phase 1: size the run and fix the output layout
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

        let schema = OutputSchema::new(&headers, &config.output)
            .with_delimiter(config.source.delimiter as u8);
        let filter = config
            .output
            .filter
            .as_ref()
            .map(|f| schema.compile_filter(f))
            .transpose()?;

        let output_dir = parent_dir(output);
        std::fs::create_dir_all(&output_dir).map_err(|e| {
            tracing::error!(dir = %output_dir.display(), error = %e, "cannot create output directory");
            Error::Io(e)
        })?;

        // Phase 2: checkpoint location and restore
        let (dir, stem) = self.checkpoint_location.clone().unwrap_or_else(|| {
            let dir = config
                .checkpoint
                .directory
                .clone()
                .unwrap_or_else(|| output_dir.clone());
            (dir, file_stem(output))
        });
        let mut checkpoints = CheckpointManager::new(&config.checkpoint, dir, stem);

        let results = Arc::new(ResultsBuffer::new(total));
        let resumed = if resume {
            restore(&checkpoints, &schema, &headers, &results).await?
        } else {
            discard_stale_checkpoints(&mut checkpoints);
            0
        };

        let source = RowSource::open(input, &config.source)?;
        let run_token = self.cancel_token.child_token();
        let processor = RowProcessor::new(&config, Arc::clone(&self.enricher), self.limiter.clone())?
            .with_cancel_token(run_token.clone());

        let ctx = RunContext {
            deadline: config
                .workers
                .run_timeout
                .map(|budget| (Instant::now() + budget, budget)),
            config,
            processor,
            schema,
            filter,
            event_tx: self.event_tx.clone(),
            run_token,
            shard: self.shard,
            retain_checkpoints: self.retain_checkpoints,
            total,
            resumed,
            started_at,
            counters: RunCounters::default(),
        };

        // Phase 3: stream rows through the worker pool
        self.set_state(PipelineState::Streaming);
        ctx.emit(Event::Started {
            total,
            resumed,
            shard: ctx.shard,
        });
        tracing::info!(
            shard = ?ctx.shard,
            input = %input.display(),
            total,
            resumed,
            concurrency = ctx.config.workers.concurrency,
            interval_ms = ctx.processor.limiter().interval().as_millis() as u64,
            enricher = ctx.processor.enricher_name(),
            "pipeline started"
        );

        let watcher = ctx.spawn_deadline_watcher();
        let fatal = dispatch(&ctx, source, &results, &mut checkpoints).await;
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        // Phase 4: write the output or leave a checkpoint behind
        let outcome = finalize_run(&ctx, &results, &mut checkpoints, output, fatal).await;
        self.set_state(match outcome {
            Ok(_) => PipelineState::Completed,
            Err(_) => PipelineState::Aborted,
        });
        outcome
    }
}

/// Load the most recent checkpoint into `results`, returning how many rows it restored.
async fn restore(
    checkpoints: &CheckpointManager,
    schema: &OutputSchema,
    headers: &Arc<Headers>,
    results: &ResultsBuffer,
) -> Result<usize> {
    let Some(path) = checkpoint::latest(checkpoints.dir(), checkpoints.stem())? else {
        tracing::info!(
            dir = %checkpoints.dir().display(),
            stem = checkpoints.stem(),
            "no checkpoint found, starting from the first row"
        );
        return Ok(0);
    };

    let restored = {
        let path = path.clone();
        let schema = schema.clone();
        let headers = Arc::clone(headers);
        blocking_io(move || checkpoint::load(&path, &schema, &headers)).await?
    };
    let mut count = 0;
    for result in restored {
        let ordinal = result.ordinal;
        if results.publish(result).is_err() {
            return Err(CheckpointError::Mismatch {
                path,
                reason: format!(
                    "row {ordinal} does not exist in the {} rows of the input",
                    results.len()
                ),
            }
            .into());
        }
        count += 1;
    }

    tracing::info!(path = %path.display(), restored = count, total = results.len(), "resuming from checkpoint");
    Ok(count)
}

/// Remove checkpoints left by an earlier run so they cannot be mistaken for this run's.
fn discard_stale_checkpoints(checkpoints: &mut CheckpointManager) {
    let stale = checkpoints.remaining();
    if stale.is_empty() {
        return;
    }
    tracing::warn!(
        dir = %checkpoints.dir().display(),
        stem = checkpoints.stem(),
        count = stale.len(),
        "discarding checkpoints from an earlier run; resume to continue from them instead"
    );
    checkpoints.clear();
}
