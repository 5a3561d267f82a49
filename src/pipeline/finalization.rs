//! Run finalization -- write the output on success, leave a checkpoint on abort.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::checkpoint::CheckpointManager;
use crate::error::{Error, Result};
use crate::output::write_results;
use crate::types::{Event, PipelineState, RunSummary};
use crate::utils::blocking_io;

use super::context::RunContext;
use super::results::ResultsBuffer;

/// Evaluate the dispatch outcome and bring the run to its final state.
///
/// A complete buffer is written to `output` in ordinal order (through the
/// post-hoc filter) and every checkpoint for the run is deleted, unless the
/// pipeline retains them. Anything else aborts the run: a final checkpoint
/// is written best-effort and [`Error::Aborted`] names it.
pub(super) async fn finalize_run(
    ctx: &RunContext,
    results: &Arc<ResultsBuffer>,
    checkpoints: &mut CheckpointManager,
    output: &Path,
    fatal: Option<Error>,
) -> Result<RunSummary> {
    if let Some(e) = fatal {
        return Err(abort(ctx, results, checkpoints, e.to_string()).await);
    }
    if !results.is_complete() {
        let reason = if ctx.run_token.is_cancelled() {
            ctx.cancel_reason()
        } else {
            format!(
                "input yielded {} of the {} rows counted at start",
                results.filled(),
                results.len()
            )
        };
        return Err(abort(ctx, results, checkpoints, reason).await);
    }

    let written = {
        let results = Arc::clone(results);
        let schema = ctx.schema.clone();
        let filter = ctx.filter.clone();
        let path = output.to_path_buf();
        blocking_io(move || write_results(&path, &schema, results.iter(), filter.as_ref())).await
    };
    let stats = match written {
        Ok(stats) => stats,
        Err(e) => {
            let reason = format!("failed to write output {}: {e}", output.display());
            return Err(abort(ctx, results, checkpoints, reason).await);
        }
    };
    if ctx.retain_checkpoints {
        checkpoints
            .write_final(&ctx.schema, results.iter(), results.filled())
            .await;
    } else {
        checkpoints.clear();
    }

    let counts = results.counts();
    ctx.emit(Event::Completed {
        total: ctx.total,
        success: counts.success,
        classified_failure: counts.classified_failure,
        error: counts.error,
        shard: ctx.shard,
    });
    tracing::info!(
        shard = ?ctx.shard,
        output = %output.display(),
        total = ctx.total,
        resumed = ctx.resumed,
        processed = ctx.counters.processed(),
        success = counts.success,
        classified_failure = counts.classified_failure,
        error = counts.error,
        written = stats.written,
        filtered = stats.filtered,
        "pipeline completed"
    );

    Ok(RunSummary {
        total: ctx.total,
        resumed: ctx.resumed,
        success: counts.success,
        classified_failure: counts.classified_failure,
        error: counts.error,
        calls: ctx.counters.calls(),
        rows_written: stats.written,
        output: output.to_path_buf(),
        state: PipelineState::Completed,
        started_at: ctx.started_at,
        finished_at: Utc::now(),
    })
}

/// Write the final checkpoint and build the abort error.
async fn abort(
    ctx: &RunContext,
    results: &ResultsBuffer,
    checkpoints: &mut CheckpointManager,
    reason: String,
) -> Error {
    let completed = results.filled();
    let checkpoint = checkpoints
        .write_final(&ctx.schema, results.iter(), completed)
        .await;

    ctx.emit(Event::Aborted {
        completed,
        total: ctx.total,
        checkpoint: checkpoint.clone(),
        shard: ctx.shard,
    });
    tracing::warn!(
        shard = ?ctx.shard,
        completed,
        total = ctx.total,
        first_pending = ?results.missing().next().map(|o| o.0),
        checkpoint = ?checkpoint,
        reason = %reason,
        "pipeline aborted"
    );

    Error::Aborted {
        reason,
        completed,
        total: ctx.total,
        checkpoint,
    }
}
