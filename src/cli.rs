//! Command line arguments for the batch-enrich binary.

use std::path::PathBuf;

use batch_enrich::{Config, Credential, RateLimitConfig, RequiredColumn};
use clap::{Parser, ValueEnum};

/// Enrich every row of a CSV file through a rate-limited provider.
///
/// Rows are classified by the provider configured in `--config` and written
/// to the output in input order with a status column (and any extra columns
/// the provider fills in). Progress is checkpointed next to the output, so an
/// interrupted run can continue with `--resume`.
///
/// Passing `--credential` more than once splits the input into one shard per
/// credential, each with its own rate limit.
///
/// ## Examples
///
/// Verify a lead list at one request per second:
///   batch-enrich --config verify.json leads.csv leads.verified.csv
///
/// Two API keys, four workers each, 500ms budget per key:
///   batch-enrich -c verify.json --concurrency 4 --interval-ms 500 \
///     --credential main=KEY1 --credential backup=KEY2 leads.csv out.csv
///
/// Continue after an interruption:
///   batch-enrich -c verify.json --resume leads.csv leads.verified.csv
#[derive(Parser, Debug)]
#[command(name = "batch-enrich")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Input CSV file with a header row
    pub input: PathBuf,

    /// Output CSV file
    pub output: PathBuf,

    /// JSON configuration file
    #[arg(short, long, env = "BATCH_ENRICH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Maximum concurrent provider calls (per shard)
    #[arg(long, value_parser = parse_positive_usize)]
    pub concurrency: Option<usize>,

    /// Minimum spacing between provider calls in milliseconds (0 disables the limit)
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Write a checkpoint every N completed rows
    #[arg(long, value_parser = parse_positive_usize)]
    pub checkpoint_every: Option<usize>,

    /// Continue from the most recent checkpoint for this output
    #[arg(long)]
    pub resume: bool,

    /// Provider credential as NAME=SECRET; repeat to shard the input
    #[arg(
        long = "credential",
        value_name = "NAME=SECRET",
        env = "BATCH_ENRICH_CREDENTIALS",
        value_delimiter = ','
    )]
    pub credentials: Vec<Credential>,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

impl Cli {
    /// Build the run configuration: the config file (or defaults) with command line overrides applied
    pub fn load_config(&self) -> batch_enrich::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(concurrency) = self.concurrency {
            config.workers.concurrency = concurrency;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.rate_limit = if interval_ms == 0 {
                RateLimitConfig::Unlimited
            } else {
                RateLimitConfig::Fixed { interval_ms }
            };
        }
        if let Some(every) = self.checkpoint_every {
            config.checkpoint.interval = every;
        }
        if !self.credentials.is_empty() {
            config.sharding.credentials = self.credentials.clone();
        }

        if let Some(provider) = &config.provider {
            // Rows without a key are classified locally instead of costing a call
            let key_column = provider.key_column.clone();
            let required = &mut config.classification.required_columns;
            if !required.iter().any(|r| r.name == key_column) {
                required.insert(0, RequiredColumn::new(key_column));
            }

            // Provider fields become output columns, after any configured ones
            let fields: Vec<String> = provider.field_pointers.keys().cloned().collect();
            for column in fields {
                if !config.output.extra_columns.contains(&column) {
                    config.output.extra_columns.push(column);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Trace level (most verbose)
    Trace,
    /// Debug level (one line per row)
    Debug,
    /// Info level (default)
    Info,
    /// Warning level
    Warn,
    /// Error level (least verbose)
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Parse a positive usize (>= 1).
fn parse_positive_usize(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if value < 1 {
        return Err("must be at least 1".to_string());
    }
    Ok(value)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("batch-enrich").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let cli = parse(&[
            "--concurrency",
            "8",
            "--interval-ms",
            "250",
            "--checkpoint-every",
            "50",
            "in.csv",
            "out.csv",
        ]);

        let config = cli.load_config().unwrap();

        assert_eq!(config.workers.concurrency, 8);
        assert!(matches!(config.rate_limit, RateLimitConfig::Fixed { interval_ms: 250 }));
        assert_eq!(config.checkpoint.interval, 50);
        assert!(config.sharding.credentials.is_empty());
    }

    #[test]
    fn zero_interval_disables_rate_limit() {
        let config = parse(&["--interval-ms", "0", "in.csv", "out.csv"])
            .load_config()
            .unwrap();
        assert!(matches!(config.rate_limit, RateLimitConfig::Unlimited));
    }

    #[test]
    fn repeated_credentials_enable_sharding() {
        let cli = parse(&[
            "--credential",
            "a=k1",
            "--credential",
            "b=k2=with-equals",
            "in.csv",
            "out.csv",
        ]);

        let config = cli.load_config().unwrap();
        let names: Vec<&str> = config.sharding.credentials.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(config.sharding.credentials[1].secret, "k2=with-equals");
    }

    #[test]
    fn malformed_credential_is_rejected() {
        let err = Cli::try_parse_from(["batch-enrich", "--credential", "nokey", "in.csv", "out.csv"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(Cli::try_parse_from(["batch-enrich", "--concurrency", "0", "a", "b"]).is_err());
    }

    #[test]
    fn provider_key_and_fields_shape_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "output": {"extra_columns": ["Checked"]},
                "provider": {
                    "endpoint": "https://verify.example.com/check",
                    "key_column": "Email",
                    "field_pointers": {"Score": "/score", "Checked": "/checked_at"}
                }
            }"#,
        )
        .unwrap();

        let cli = parse(&["--config", path.to_str().unwrap(), "in.csv", "out.csv"]);
        let config = cli.load_config().unwrap();

        assert_eq!(config.classification.required_columns[0].name, "Email");
        assert_eq!(config.output.extra_columns, vec!["Checked", "Score"]);
    }
}
