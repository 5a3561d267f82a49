//! Worker pool -- bounded-concurrency dispatch of rows and periodic checkpoints.

use std::io::Read;

use futures::stream::{self, StreamExt};

use crate::checkpoint::{CheckpointManager, Settled};
use crate::error::Error;
use crate::source::RowSource;
use crate::types::{Event, RowResult};

use super::context::RunContext;
use super::results::ResultsBuffer;

/// Drive every pending row of `source` to a terminal state.
///
/// Rows are claimed in input order from the single source cursor, skipping
/// ordinals already present in `results` (restored from a checkpoint). At
/// most `workers.concurrency` rows are in flight; each result lands in its
/// ordinal's slot as soon as it completes.
///
/// Claiming stops when the run token is cancelled, and rows still waiting
/// for a rate-limiter slot give up and stay pending. Calls already
/// dispatched are awaited and recorded. Checkpoint snapshots are written on
/// the blocking pool while workers keep running.
///
/// Returns the first pipeline-fatal error (unreadable input under the
/// fail-fast policy, failed checkpoint write), if any.
pub(super) async fn dispatch<R: Read>(
    ctx: &RunContext,
    source: RowSource<R>,
    results: &ResultsBuffer,
    checkpoints: &mut CheckpointManager,
) -> Option<Error> {
    let concurrency = ctx.config.workers.concurrency;
    let mut source_error = None;
    let mut fatal = None;
    let mut abandoned = 0usize;

    {
        let pending = source.filter_map(|item| match item {
            Ok((ordinal, _)) if results.contains(ordinal) => None,
            Ok(pair) => Some(pair),
            Err(e) => {
                source_error = Some(e);
                None
            }
        });

        let mut completions = std::pin::pin!(
            stream::iter(pending)
                .take_until(ctx.run_token.clone().cancelled_owned())
                .map(|(ordinal, row)| ctx.processor.process(ordinal, row))
                .buffer_unordered(concurrency)
        );

        loop {
            tokio::select! {
                settled = checkpoints.settle(), if checkpoints.is_writing() => {
                    if let Some(outcome) = settled {
                        report_checkpoint(ctx, outcome, &mut fatal);
                    }
                }
                next = completions.next() => {
                    let Some(outcome) = next else { break };
                    let Some(result) = outcome else {
                        abandoned += 1;
                        continue;
                    };
                    let Some(completed) = record(ctx, results, result, &mut fatal) else {
                        continue;
                    };
                    if fatal.is_some() || !checkpoints.is_due(completed) {
                        continue;
                    }
                    let snapshot: Vec<RowResult> = results.iter().cloned().collect();
                    if let Some(previous) = checkpoints.begin(&ctx.schema, snapshot, completed).await {
                        report_checkpoint(ctx, previous, &mut fatal);
                    }
                }
            }
        }
    }

    if let Some(outcome) = checkpoints.settle().await {
        report_checkpoint(ctx, outcome, &mut fatal);
    }
    if abandoned > 0 {
        tracing::info!(shard = ?ctx.shard, abandoned, "rows left pending, no call was dispatched for them");
    }
    if let Some(e) = &source_error {
        tracing::error!(shard = ?ctx.shard, error = %e, "input became unreadable mid-run");
    }
    source_error.or(fatal)
}

/// Publish one result and report progress; returns the completed count.
fn record(
    ctx: &RunContext,
    results: &ResultsBuffer,
    result: RowResult,
    fatal: &mut Option<Error>,
) -> Option<usize> {
    let ordinal = result.ordinal;
    let state = result.state;
    ctx.counters.record(&result);

    let completed = match results.publish(result) {
        Ok(completed) => completed,
        Err(rejected) => {
            tracing::error!(
                shard = ?ctx.shard,
                ordinal = rejected.ordinal.0,
                total = ctx.total,
                "row result has no free slot"
            );
            fail(
                ctx,
                fatal,
                Error::Other(format!(
                    "row {} was produced twice or lies beyond the {} rows counted at start",
                    rejected.ordinal, ctx.total
                )),
            );
            return None;
        }
    };

    ctx.emit(Event::RowCompleted {
        ordinal,
        completed,
        total: ctx.total,
        state,
        shard: ctx.shard,
    });
    tracing::debug!(
        shard = ?ctx.shard,
        ordinal = ordinal.0,
        completed,
        total = ctx.total,
        state = %state,
        "row completed"
    );
    Some(completed)
}

/// Announce a durable checkpoint, or fail the run if it could not be written.
fn report_checkpoint(ctx: &RunContext, settled: Settled, fatal: &mut Option<Error>) {
    let completed = settled.completed;
    match settled.outcome {
        Ok(path) => ctx.emit(Event::CheckpointWritten {
            completed,
            path,
            shard: ctx.shard,
        }),
        Err(e) => {
            tracing::error!(shard = ?ctx.shard, completed, error = %e, "checkpoint write failed");
            fail(ctx, fatal, e);
        }
    }
}

/// Keep the first fatal error and stop claiming rows.
fn fail(ctx: &RunContext, fatal: &mut Option<Error>, error: Error) {
    if fatal.is_none() {
        *fatal = Some(error);
    }
    ctx.run_token.cancel();
}
