//! batch-enrich CLI
//!
//! Enriches a CSV file through the configured HTTP provider, optionally
//! sharded over several credentials.

use std::process::ExitCode;
use std::sync::Arc;

use batch_enrich::orchestrator::{shard_checkpoint_dir, shard_stem};
use batch_enrich::{
    Error, Event, HttpEnricher, HttpEnricherFactory, Orchestrator, Pipeline, Result, RunSummary,
    ShardError, cancel_on_signal, checkpoint,
};
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

mod cli;
mod logging;

use cli::Cli;

/// Exit code for invalid arguments or configuration (matches clap's usage errors)
const EXIT_CONFIG: u8 = 2;
/// Exit code for unreadable input and other I/O failures
const EXIT_IO: u8 = 1;
/// Exit code for a run that stopped early and left a checkpoint
const EXIT_ABORTED: u8 = 3;
/// Exit code for a sharded run where at least one shard failed
const EXIT_SHARD: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    logging::init_logging(args.log_level);

    match run(&args).await {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            report_failure(&args, &e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(args: &Cli) -> Result<RunSummary> {
    let config = args.load_config()?;
    let provider = config.provider.clone().ok_or_else(|| Error::Config {
        message: "no provider configured; pass --config with a \"provider\" section".to_string(),
        key: Some("provider".to_string()),
    })?;

    let token = CancellationToken::new();
    let signals = cancel_on_signal(token.clone());

    let outcome = if config.sharding.credentials.is_empty() {
        let enricher = Arc::new(HttpEnricher::from_config(&provider)?);
        let pipeline = Pipeline::new(config, enricher)?.with_cancel_token(token);
        let progress = tokio::spawn(report_progress(pipeline.subscribe()));

        let outcome = if args.resume {
            pipeline.resume(&args.input, &args.output).await
        } else {
            pipeline.run(&args.input, &args.output).await
        };
        progress.abort();
        outcome
    } else {
        let factory = Arc::new(HttpEnricherFactory::new(provider));
        let orchestrator = Orchestrator::new(config, factory)?.with_cancel_token(token);
        let progress = tokio::spawn(report_progress(orchestrator.subscribe()));

        let outcome = if args.resume {
            orchestrator.resume(&args.input, &args.output).await
        } else {
            orchestrator.run(&args.input, &args.output).await
        };
        progress.abort();
        outcome
    };

    signals.abort();
    outcome
}

/// Log coarse progress (every 5%) and checkpoints from the event stream.
async fn report_progress(mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(Event::RowCompleted {
                completed,
                total,
                shard,
                ..
            }) => {
                let step = (total / 20).max(1);
                if completed % step == 0 || completed == total {
                    tracing::info!(
                        shard = ?shard,
                        completed,
                        total,
                        percent = completed * 100 / total.max(1),
                        "progress"
                    );
                }
            }
            Ok(Event::ShardFinished { shard, ok }) => {
                tracing::info!(shard, ok, "shard finished");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn exit_code(error: &Error) -> u8 {
    match error {
        Error::Config { .. } | Error::Serialization(_) => EXIT_CONFIG,
        Error::Aborted { .. } => EXIT_ABORTED,
        Error::Shard(ShardError::NoCredentials) => EXIT_CONFIG,
        Error::Shard(_) => EXIT_SHARD,
        Error::Io(_)
        | Error::Csv(_)
        | Error::Source { .. }
        | Error::Checkpoint(_)
        | Error::Network(_)
        | Error::Other(_) => EXIT_IO,
    }
}

fn print_summary(summary: &RunSummary) {
    let duration = summary.finished_at - summary.started_at;
    println!("Enrichment completed:");
    println!("  Rows:               {}", summary.total);
    if summary.resumed > 0 {
        println!("  Resumed:            {}", summary.resumed);
    }
    println!("  Success:            {}", summary.success);
    println!("  Classified failure: {}", summary.classified_failure);
    println!("  Error:              {}", summary.error);
    println!("  Provider calls:     {}", summary.calls);
    println!("  Rows written:       {}", summary.rows_written);
    println!("  Output:             {}", summary.output.display());
    println!(
        "  Duration:           {:.2}s",
        duration.num_milliseconds() as f64 / 1000.0
    );
}

fn report_failure(args: &Cli, error: &Error) {
    eprintln!("error: {error}");
    match error {
        Error::Aborted {
            checkpoint: Some(path),
            completed,
            total,
            ..
        } => {
            eprintln!("  {completed} of {total} rows are saved in {}", path.display());
            eprintln!("  re-run with --resume to continue");
        }
        Error::Shard(ShardError::Failed { failures, .. }) => {
            for failure in failures {
                eprintln!("  shard {}: {}", failure.shard, failure.message);
            }
            print_surviving_checkpoints(args);
        }
        _ => {}
    }
}

fn print_surviving_checkpoints(args: &Cli) {
    let Ok(config) = args.load_config() else {
        return;
    };
    let dir = shard_checkpoint_dir(&config, &args.output);
    let mut found = Vec::new();
    for shard in 0..config.sharding.credentials.len() {
        if let Ok(Some(path)) = checkpoint::latest(&dir, &shard_stem(&args.output, shard)) {
            found.push(path);
        }
    }
    if !found.is_empty() {
        eprintln!("  checkpoints kept for --resume:");
        for path in found {
            eprintln!("    {}", path.display());
        }
    }
}
