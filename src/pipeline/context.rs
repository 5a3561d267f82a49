//! Shared state for a single pipeline run, reducing parameter passing between helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::enrich::RowProcessor;
use crate::output::{OutputSchema, RowFilter};
use crate::types::{Event, RowResult};

/// Atomic counters owned by one run.
#[derive(Debug, Default)]
pub(super) struct RunCounters {
    /// Rows enriched (or classified locally) during this run, excluding restored rows
    pub(super) processed: AtomicUsize,
    /// Enrichment calls issued during this run
    pub(super) calls: AtomicU64,
}

impl RunCounters {
    pub(super) fn record(&self, result: &RowResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.calls.fetch_add(u64::from(result.calls), Ordering::Relaxed);
    }

    pub(super) fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub(super) fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }
}

/// Everything the worker pool and finalization need for one run.
pub(super) struct RunContext {
    pub(super) config: Arc<Config>,
    pub(super) processor: RowProcessor,
    pub(super) schema: OutputSchema,
    pub(super) filter: Option<RowFilter>,
    pub(super) event_tx: broadcast::Sender<Event>,
    /// Child of the pipeline's token; also cancelled by the run deadline and by fatal errors
    pub(super) run_token: CancellationToken,
    pub(super) deadline: Option<(Instant, Duration)>,
    pub(super) shard: Option<usize>,
    /// Leave a complete checkpoint behind on success instead of deleting them
    pub(super) retain_checkpoints: bool,
    pub(super) total: usize,
    pub(super) resumed: usize,
    pub(super) started_at: DateTime<Utc>,
    pub(super) counters: RunCounters,
}

impl RunContext {
    /// Broadcast an event; having no subscribers is fine.
    pub(super) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Why the run token was cancelled, for the abort error.
    pub(super) fn cancel_reason(&self) -> String {
        match self.deadline {
            Some((at, budget)) if Instant::now() >= at => {
                format!("run timeout of {}ms elapsed", budget.as_millis())
            }
            _ => "cancelled".to_string(),
        }
    }

    /// Spawn a watcher that cancels the run once its wall-clock budget is spent.
    pub(super) fn spawn_deadline_watcher(&self) -> Option<tokio::task::JoinHandle<()>> {
        let (at, budget) = self.deadline?;
        let token = self.run_token.clone();
        let shard = self.shard;
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(at) => {
                    tracing::warn!(
                        shard = ?shard,
                        budget_ms = budget.as_millis() as u64,
                        "run timeout elapsed, cancelling"
                    );
                    token.cancel();
                }
            }
        }))
    }
}
