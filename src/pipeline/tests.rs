//! Tests for the pipeline module.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{self, CheckpointManager};
use crate::config::{Config, MalformedPolicy, OutputFilter, RateLimitConfig, RequiredColumn};
use crate::enrich::{Enricher, Enrichment, RowProcessor};
use crate::error::{CheckpointError, EnrichError, Error};
use crate::output::OutputSchema;
use crate::rate_limiter::RateLimiter;
use crate::source::RowSource;
use crate::types::{Event, Headers, Ordinal, PipelineState, Row, RowResult, TerminalState};

use super::Pipeline;
use super::context::{RunContext, RunCounters};
use super::finalization::finalize_run;
use super::results::ResultsBuffer;
use super::worker_pool::dispatch;

/// Labels rows by their email domain and records how it was called
#[derive(Default)]
struct DomainEnricher {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl DomainEnricher {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    /// Cancel `token` during call number `calls` (1-based)
    fn cancelling(calls: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel_after: Some((calls, token)),
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enricher for DomainEnricher {
    async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some((after, token)) = &self.cancel_after
            && n == *after
        {
            token.cancel();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let email = row.get("Email").unwrap_or_default();
        let domain = email.rsplit('@').next().unwrap_or_default();
        if domain.ends_with(".io") {
            Ok(Enrichment::success("Good").with_field("Domain", domain))
        } else {
            Ok(Enrichment::failure("Bad").with_field("Domain", domain))
        }
    }

    fn name(&self) -> &'static str {
        "domain"
    }
}

fn config() -> Config {
    let mut config = Config {
        rate_limit: RateLimitConfig::Unlimited,
        ..Config::default()
    };
    config.workers.concurrency = 4;
    config.output.extra_columns = vec!["Domain".to_string()];
    config
}

fn write_input(dir: &Path, rows: usize) -> PathBuf {
    let path = dir.join("leads.csv");
    let mut content = String::from("Name,Email\n");
    for i in 0..rows {
        let domain = if i % 3 == 0 { "corp.com" } else { "mail.io" };
        content.push_str(&format!("user{i},user{i}@{domain}\n"));
    }
    std::fs::write(&path, content).unwrap();
    path
}

fn read_rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

fn checkpoint_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains("_backup_"))
        .collect();
    names.sort();
    names
}

fn result(i: usize, state: TerminalState) -> RowResult {
    let headers = Arc::new(Headers::new(["Name"]));
    RowResult {
        ordinal: Ordinal(i),
        row: Row::new(headers, vec![format!("n{i}")]),
        state,
        label: "x".to_string(),
        fields: BTreeMap::new(),
        calls: 1,
        error: None,
    }
}

// -----------------------------------------------------------------------
// ResultsBuffer
// -----------------------------------------------------------------------

#[test]
fn results_buffer_publishes_each_slot_once() {
    let buffer = ResultsBuffer::new(3);

    assert_eq!(buffer.publish(result(2, TerminalState::Success)).unwrap(), 1);
    assert_eq!(buffer.publish(result(0, TerminalState::Success)).unwrap(), 2);

    let duplicate = buffer.publish(result(2, TerminalState::UnrecoverableError));
    assert!(duplicate.is_err(), "a slot must not be published twice");
    assert_eq!(
        buffer.iter().find(|r| r.ordinal == Ordinal(2)).unwrap().state,
        TerminalState::Success,
        "the first result must survive a second publish"
    );

    assert!(buffer.publish(result(3, TerminalState::Success)).is_err(), "out of range");
    assert_eq!(buffer.filled(), 2);
    assert!(!buffer.is_complete());
    assert_eq!(buffer.missing().collect::<Vec<_>>(), vec![Ordinal(1)]);
}

#[test]
fn results_buffer_iterates_in_ordinal_order() {
    let buffer = ResultsBuffer::new(4);
    for i in [3, 1, 0, 2] {
        let state = if i == 1 {
            TerminalState::UnrecoverableError
        } else {
            TerminalState::Success
        };
        buffer.publish(result(i, state)).unwrap();
    }

    let order: Vec<usize> = buffer.iter().map(|r| r.ordinal.0).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
    assert!(buffer.is_complete());

    let counts = buffer.counts();
    assert_eq!(counts.success, 3);
    assert_eq!(counts.error, 1);
    assert_eq!(counts.classified_failure, 0);
}

#[test]
fn results_buffer_accepts_concurrent_publishers() {
    let buffer = Arc::new(ResultsBuffer::new(400));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in (t..400).step_by(4) {
                    buffer.publish(result(i, TerminalState::Success)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(buffer.is_complete());
    assert_eq!(buffer.iter().count(), 400);
}

// -----------------------------------------------------------------------
// Pipeline::run
// -----------------------------------------------------------------------

#[tokio::test]
async fn run_writes_every_row_in_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 25);
    let output = dir.path().join("leads.out.csv");
    let enricher = DomainEnricher::new();

    let pipeline = Pipeline::new(config(), enricher.clone()).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Idle);
    let summary = pipeline.run(&input, &output).await.unwrap();

    assert_eq!(pipeline.state(), PipelineState::Completed);
    assert_eq!(summary.total, 25);
    assert_eq!(summary.success + summary.classified_failure + summary.error, 25);
    assert_eq!(summary.classified_failure, 9, "every third row is on a .com domain");
    assert_eq!(summary.calls, 25);
    assert_eq!(summary.rows_written, 25);
    assert_eq!(enricher.calls(), 25);

    let rows = read_rows(&output);
    assert_eq!(rows.len(), 25);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row[0], format!("user{i}"), "row {i} out of order");
        let expected = if i % 3 == 0 { "Bad" } else { "Good" };
        assert_eq!(row[2], expected);
    }
    let header = csv::Reader::from_path(&output).unwrap().headers().unwrap().clone();
    assert_eq!(
        header.iter().collect::<Vec<_>>(),
        vec!["Name", "Email", "Status", "Domain"]
    );
}

#[tokio::test]
async fn run_never_exceeds_configured_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 30);
    let output = dir.path().join("out.csv");
    let enricher = DomainEnricher::slow(Duration::from_millis(5));

    let mut config = config();
    config.workers.concurrency = 3;
    Pipeline::new(config, enricher.clone())
        .unwrap()
        .run(&input, &output)
        .await
        .unwrap();

    let peak = enricher.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight calls was {peak}");
    assert!(peak >= 2, "rows should overlap, peak was {peak}");
}

#[tokio::test]
async fn run_emits_progress_events() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 5);
    let output = dir.path().join("out.csv");

    let pipeline = Pipeline::new(config(), DomainEnricher::new())
        .unwrap()
        .with_shard(7);
    let mut events = pipeline.subscribe();
    pipeline.run(&input, &output).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert!(matches!(
        seen.first(),
        Some(Event::Started { total: 5, resumed: 0, shard: Some(7) })
    ));
    let completed: Vec<usize> = seen
        .iter()
        .filter_map(|e| match e {
            Event::RowCompleted { completed, .. } => Some(*completed),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![1, 2, 3, 4, 5], "completed count is monotonic");
    assert!(matches!(
        seen.last(),
        Some(Event::Completed { total: 5, shard: Some(7), .. })
    ));
}

#[tokio::test]
async fn run_applies_output_filter_to_complete_result_set() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 9);
    let output = dir.path().join("good.csv");

    let mut config = config();
    config.output.filter = Some(OutputFilter {
        column: None,
        keep: vec!["Good".to_string()],
    });
    let summary = Pipeline::new(config, DomainEnricher::new())
        .unwrap()
        .run(&input, &output)
        .await
        .unwrap();

    assert_eq!(summary.total, 9);
    assert_eq!(summary.rows_written, 6);
    let names: Vec<String> = read_rows(&output).into_iter().map(|r| r[0].clone()).collect();
    assert_eq!(names, vec!["user1", "user2", "user4", "user5", "user7", "user8"]);
}

#[tokio::test]
async fn rows_missing_required_column_make_no_calls() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    std::fs::write(&input, "Name,Email\nada,ada@x.io\nbob,\ncy,cy@x.io\n").unwrap();
    let output = dir.path().join("out.csv");
    let enricher = DomainEnricher::new();

    let mut config = config();
    config.classification.required_columns.push(RequiredColumn {
        missing_label: Some("No email".to_string()),
        ..RequiredColumn::new("Email")
    });
    let summary = Pipeline::new(config, enricher.clone())
        .unwrap()
        .run(&input, &output)
        .await
        .unwrap();

    assert_eq!(enricher.calls(), 2);
    assert_eq!(summary.calls, 2);
    assert_eq!(summary.classified_failure, 1);
    let rows = read_rows(&output);
    assert_eq!(rows[1], vec!["bob", "", "No email", ""]);
}

#[tokio::test]
async fn empty_input_completes_with_header_only() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    std::fs::write(&input, "Name,Email\n").unwrap();
    let output = dir.path().join("out.csv");

    let summary = Pipeline::new(config(), DomainEnricher::new())
        .unwrap()
        .run(&input, &output)
        .await
        .unwrap();

    assert_eq!(summary.total, 0);
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "Name,Email,Status,Domain\n"
    );
}

#[tokio::test]
async fn missing_input_is_reported_before_the_run_starts() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(config(), DomainEnricher::new()).unwrap();

    let err = pipeline
        .run(&dir.path().join("nope.csv"), &dir.path().join("out.csv"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Io(_)), "got {err:?}");
    assert_eq!(pipeline.state(), PipelineState::Idle);
}

// -----------------------------------------------------------------------
// Checkpoints, cancellation and resume
// -----------------------------------------------------------------------

#[tokio::test]
async fn checkpoints_are_written_periodically_and_removed_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10);
    let output = dir.path().join("out.csv");

    let mut config = config();
    config.checkpoint.interval = 4;
    let pipeline = Pipeline::new(config, DomainEnricher::new()).unwrap();
    let mut events = pipeline.subscribe();
    pipeline.run(&input, &output).await.unwrap();

    let mut written = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::CheckpointWritten { completed, path, .. } = event {
            written.push((completed, path));
        }
    }
    let counts: Vec<usize> = written.iter().map(|(n, _)| *n).collect();
    assert_eq!(counts, vec![4, 8]);
    assert!(written[0].1.ends_with("out_backup_4.csv"));
    assert!(checkpoint_files(dir.path()).is_empty(), "checkpoints deleted on success");
}

#[tokio::test]
async fn cancelled_run_leaves_checkpoint_and_resume_finishes_it() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 12);
    let output = dir.path().join("out.csv");

    let mut config = config();
    config.workers.concurrency = 1;
    config.checkpoint.interval = 2;

    let token = CancellationToken::new();
    let first = DomainEnricher::cancelling(5, token.clone());
    let pipeline = Pipeline::new(config.clone(), first.clone())
        .unwrap()
        .with_cancel_token(token);

    let err = pipeline.run(&input, &output).await.unwrap_err();
    let Error::Aborted {
        completed,
        total,
        checkpoint,
        reason,
    } = err
    else {
        panic!("expected Aborted, got {err:?}");
    };
    assert_eq!(reason, "cancelled");
    assert_eq!(completed, 5, "the in-flight row is recorded before stopping");
    assert_eq!(total, 12);
    assert!(checkpoint.unwrap().ends_with("out_backup_5.csv"));
    assert_eq!(pipeline.state(), PipelineState::Aborted);
    assert!(!output.exists());

    let second = DomainEnricher::new();
    let summary = Pipeline::new(config, second.clone())
        .unwrap()
        .resume(&input, &output)
        .await
        .unwrap();

    assert_eq!(summary.resumed, 5);
    assert_eq!(second.calls(), 7, "only rows missing from the checkpoint are enriched");
    assert_eq!(summary.calls, 7);

    let rows = read_rows(&output);
    let names: Vec<String> = rows.iter().map(|r| r[0].clone()).collect();
    let expected: Vec<String> = (0..12).map(|i| format!("user{i}")).collect();
    assert_eq!(names, expected);
    assert!(checkpoint_files(dir.path()).is_empty());
}

#[tokio::test]
async fn cancelling_before_start_aborts_without_calls() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 4);
    let output = dir.path().join("out.csv");
    let enricher = DomainEnricher::new();

    let pipeline = Pipeline::new(config(), enricher.clone()).unwrap();
    pipeline.cancel_token().cancel();
    let err = pipeline.run(&input, &output).await.unwrap_err();

    assert!(
        matches!(err, Error::Aborted { completed: 0, checkpoint: None, .. }),
        "got {err:?}"
    );
    assert_eq!(enricher.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn run_timeout_aborts_through_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10);
    let output = dir.path().join("out.csv");

    let mut config = config();
    config.workers.concurrency = 1;
    config.workers.call_timeout = Duration::from_secs(60);
    config.workers.run_timeout = Some(Duration::from_millis(2500));
    config.checkpoint.interval = 100;

    let enricher = DomainEnricher::slow(Duration::from_secs(1));
    let err = Pipeline::new(config, enricher.clone())
        .unwrap()
        .run(&input, &output)
        .await
        .unwrap_err();

    let Error::Aborted {
        reason,
        completed,
        checkpoint,
        ..
    } = err
    else {
        panic!("expected Aborted, got {err:?}");
    };
    assert!(reason.contains("run timeout"), "reason was {reason:?}");
    assert_eq!(completed, 3, "the row in flight at the deadline still completes");
    assert!(checkpoint.unwrap().ends_with("out_backup_3.csv"));
}

#[tokio::test]
async fn failed_checkpoint_write_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 6);
    let output = dir.path().join("out.csv");
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();

    let mut config = config();
    config.checkpoint.interval = 2;
    config.checkpoint.directory = Some(blocker.join("backups"));

    let err = Pipeline::new(config, DomainEnricher::new())
        .unwrap()
        .run(&input, &output)
        .await
        .unwrap_err();

    let Error::Aborted { reason, .. } = err else {
        panic!("expected Aborted, got {err:?}");
    };
    assert!(reason.contains("checkpoint"), "reason was {reason:?}");
    assert!(!output.exists());
}

#[tokio::test]
async fn resume_rejects_checkpoint_from_a_longer_input() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.csv");

    // A cancelled run over 8 rows leaves a checkpoint behind.
    let long_input = write_input(dir.path(), 8);
    let mut config = config();
    config.workers.concurrency = 1;
    config.checkpoint.interval = 100;
    let token = CancellationToken::new();
    let pipeline = Pipeline::new(config.clone(), DomainEnricher::cancelling(7, token.clone()))
        .unwrap()
        .with_cancel_token(token);
    pipeline.run(&long_input, &output).await.unwrap_err();

    // The input shrinks to 3 rows before resuming.
    let short_input = write_input(dir.path(), 3);
    let err = Pipeline::new(config, DomainEnricher::new())
        .unwrap()
        .resume(&short_input, &output)
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::Checkpoint(CheckpointError::Mismatch { .. })),
        "got {err:?}"
    );
}

#[tokio::test]
async fn resume_without_checkpoint_runs_from_the_start() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 4);
    let output = dir.path().join("out.csv");
    let enricher = DomainEnricher::new();

    let summary = Pipeline::new(config(), enricher.clone())
        .unwrap()
        .resume(&input, &output)
        .await
        .unwrap();

    assert_eq!(summary.resumed, 0);
    assert_eq!(enricher.calls(), 4);
}

#[tokio::test]
async fn explicit_checkpoint_location_overrides_output_stem() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 4);
    let output = dir.path().join("out.csv");
    let backups = dir.path().join("backups");

    let mut config = config();
    config.workers.concurrency = 1;
    config.checkpoint.interval = 2;
    let token = CancellationToken::new();
    let err = Pipeline::new(config, DomainEnricher::cancelling(3, token.clone()))
        .unwrap()
        .with_cancel_token(token)
        .with_checkpoint_location(&backups, "job42")
        .run(&input, &output)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Aborted { completed: 3, .. }), "got {err:?}");
    assert_eq!(
        checkpoint_files(&backups),
        vec!["job42_backup_2.csv", "job42_backup_3.csv"]
    );
}

// -----------------------------------------------------------------------
// Input failing mid-run
// -----------------------------------------------------------------------

#[tokio::test]
async fn malformed_record_mid_run_aborts_with_earlier_rows_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.csv");

    // The pipeline counts with the same policy first, so a file that is
    // malformed from the start never gets here. This models an input that
    // was rewritten after counting: 300 rows counted, row 150 now broken.
    let mut data = String::from("Name,Email\n");
    for i in 0..300 {
        if i == 150 {
            data.push_str("broken\n");
        } else {
            data.push_str(&format!("user{i},user{i}@mail.io\n"));
        }
    }

    let mut config = config();
    config.workers.concurrency = 1;
    config.checkpoint.interval = 100;
    config.source.chunk_size = 10;
    config.source.malformed = MalformedPolicy::FailFast;

    let source = RowSource::from_reader(data.as_bytes(), &config.source).unwrap();
    let headers = Arc::clone(source.headers());
    let schema = OutputSchema::new(&headers, &config.output);
    let mut checkpoints = CheckpointManager::new(&config.checkpoint, dir.path().to_path_buf(), "out");

    let enricher = DomainEnricher::new();
    let run_token = CancellationToken::new();
    let processor = RowProcessor::new(&config, enricher.clone(), RateLimiter::unlimited())
        .unwrap()
        .with_cancel_token(run_token.clone());
    let ctx = RunContext {
        config: Arc::new(config),
        processor,
        schema: schema.clone(),
        filter: None,
        event_tx: broadcast::channel(16).0,
        run_token,
        deadline: None,
        shard: None,
        retain_checkpoints: false,
        total: 300,
        resumed: 0,
        started_at: Utc::now(),
        counters: RunCounters::default(),
    };
    let results = Arc::new(ResultsBuffer::new(300));

    let fatal = dispatch(&ctx, source, &results, &mut checkpoints).await;
    assert!(
        matches!(fatal, Some(Error::Source { .. })),
        "the read error is the run's fatal error: {fatal:?}"
    );

    let err = finalize_run(&ctx, &results, &mut checkpoints, &output, fatal)
        .await
        .unwrap_err();
    let Error::Aborted {
        completed,
        total,
        checkpoint,
        ..
    } = err
    else {
        panic!("expected Aborted, got {err:?}");
    };
    assert_eq!(completed, 150);
    assert_eq!(total, 300);
    assert_eq!(enricher.calls(), 150);
    assert!(!output.exists());

    let checkpoint = checkpoint.expect("rows before the bad record are checkpointed");
    assert_eq!(checkpoint, dir.path().join("out_backup_150.csv"));
    let restored = checkpoint::load(&checkpoint, &schema, &headers).unwrap();
    assert_eq!(restored.len(), 150);
    assert!(restored.iter().all(|r| r.ordinal.0 < 150));
    assert_eq!(
        checkpoint_files(dir.path()),
        vec!["out_backup_100.csv", "out_backup_150.csv"]
    );
}
