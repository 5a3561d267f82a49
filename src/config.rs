//! Configuration types for batch-enrich
//!
//! Every knob of a run lives in one typed [`Config`] tree. Sections are nested
//! (not flattened) and reject unknown keys, so a typo in a JSON config file
//! fails at startup instead of deep inside a run. [`Config::validate`] checks
//! the cross-field rules serde cannot express.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration for a pipeline or sharded run
///
/// All sections have sensible defaults; `Config::default()` is a valid
/// configuration for a library user that supplies its own enricher.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Input reading (delimiter, chunking, malformed-record policy)
    #[serde(default)]
    pub source: SourceConfig,

    /// Worker pool sizing and call timeouts
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Provider request budget
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Bounded retry for transient row errors (disabled by default)
    #[serde(default)]
    pub retry: RetryConfig,

    /// Periodic backup of in-progress results
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Output columns and post-hoc filtering
    #[serde(default)]
    pub output: OutputConfig,

    /// Local classification before any external call
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// HTTP provider used by the command line tool
    #[serde(default)]
    pub provider: Option<ProviderConfig>,

    /// Multi-credential sharding
    #[serde(default)]
    pub sharding: ShardingConfig,
}

impl Config {
    /// Load a configuration from a JSON file and validate it
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {e}", path.display()),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("invalid config {}: {e}", path.display()),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field rules; returns the first violation found
    pub fn validate(&self) -> Result<()> {
        if self.source.chunk_size == 0 {
            return Err(Error::config("source.chunk_size", "must be at least 1"));
        }
        if !self.source.delimiter.is_ascii() {
            return Err(Error::config(
                "source.delimiter",
                format!("{:?} is not a single-byte ASCII character", self.source.delimiter),
            ));
        }
        if self.workers.concurrency == 0 {
            return Err(Error::config("workers.concurrency", "must be at least 1"));
        }
        if self.workers.call_timeout.is_zero() {
            return Err(Error::config("workers.call_timeout_ms", "must be greater than 0"));
        }
        if let Some(budget) = self.workers.run_timeout
            && budget.is_zero()
        {
            return Err(Error::config("workers.run_timeout_ms", "must be greater than 0"));
        }
        if let RateLimitConfig::Proportional { budget_ms } = self.rate_limit
            && budget_ms == 0
        {
            return Err(Error::config(
                "rate_limit.budget_ms",
                "must be greater than 0 (use mode \"unlimited\" to disable)",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if self.checkpoint.enabled && self.checkpoint.interval == 0 {
            return Err(Error::config("checkpoint.interval", "must be at least 1"));
        }
        if self.output.label_column.trim().is_empty() {
            return Err(Error::config("output.label_column", "must not be empty"));
        }
        if let Some(filter) = &self.output.filter
            && filter.keep.is_empty()
        {
            return Err(Error::config(
                "output.filter.keep",
                "must list at least one value to keep",
            ));
        }
        for (i, required) in self.classification.required_columns.iter().enumerate() {
            if required.name.trim().is_empty() {
                return Err(Error::config(
                    &format!("classification.required_columns[{i}].name"),
                    "must not be empty",
                ));
            }
            if let Some(pattern) = &required.pattern
                && let Err(e) = regex::Regex::new(pattern)
            {
                return Err(Error::config(
                    &format!("classification.required_columns[{i}].pattern"),
                    format!("invalid regex: {e}"),
                ));
            }
        }
        if let Some(provider) = &self.provider {
            provider.validate()?;
        }
        for (i, credential) in self.sharding.credentials.iter().enumerate() {
            if credential.name.trim().is_empty() {
                return Err(Error::config(
                    &format!("sharding.credentials[{i}].name"),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }
}

/// What to do with a record that cannot be read as a row
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Log a warning and continue without the record (default)
    #[default]
    SkipAndWarn,
    /// Stop reading and fail the run
    FailFast,
}

/// Input reading configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Field delimiter (default: ',')
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Records read per chunk (default: 10000)
    ///
    /// Bounds how many records are buffered ahead of the worker pool and how many
    /// rows are held in memory while staging shard inputs.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Skip records whose fields are all blank (default: true)
    #[serde(default = "default_true")]
    pub skip_empty_lines: bool,

    /// Handling of records with the wrong field count or invalid UTF-8
    #[serde(default)]
    pub malformed: MalformedPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            chunk_size: default_chunk_size(),
            skip_empty_lines: true,
            malformed: MalformedPolicy::default(),
        }
    }
}

/// Worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Maximum enrichment calls in flight (default: 5)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-call timeout in milliseconds (default: 10000)
    #[serde(
        default = "default_call_timeout",
        rename = "call_timeout_ms",
        with = "duration_ms_serde"
    )]
    pub call_timeout: Duration,

    /// Optional wall-clock budget for a whole run, in milliseconds
    ///
    /// When it elapses the run is cancelled the same way an operator abort is:
    /// in-flight calls finish and a final checkpoint is written.
    #[serde(default, rename = "run_timeout_ms", with = "optional_duration_ms_serde")]
    pub run_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            call_timeout: default_call_timeout(),
            run_timeout: None,
        }
    }
}

/// Provider request budget: how dispatches are spaced
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum RateLimitConfig {
    /// Fixed minimum interval between dispatches
    Fixed {
        /// Interval in milliseconds (1000 = one call per second)
        interval_ms: u64,
    },
    /// A per-second budget shared by all workers: interval = ceil(budget / concurrency)
    Proportional {
        /// Budget window in milliseconds
        budget_ms: u64,
    },
    /// No spacing at all
    Unlimited,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig::Fixed { interval_ms: 1000 }
    }
}

impl RateLimitConfig {
    /// Minimum spacing between dispatches for the given worker count
    pub fn effective_interval(&self, concurrency: usize) -> Duration {
        match *self {
            RateLimitConfig::Fixed { interval_ms } => Duration::from_millis(interval_ms),
            RateLimitConfig::Proportional { budget_ms } => {
                let workers = concurrency.max(1) as u64;
                Duration::from_millis(budget_ms.div_ceil(workers))
            }
            RateLimitConfig::Unlimited => Duration::ZERO,
        }
    }
}

/// Retry configuration for transient row failures
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 0, no retry)
    #[serde(default)]
    pub max_attempts: u32,

    /// Initial delay before first retry in milliseconds (default: 1000)
    #[serde(
        default = "default_initial_delay",
        rename = "initial_delay_ms",
        with = "duration_ms_serde"
    )]
    pub initial_delay: Duration,

    /// Maximum delay between retries in milliseconds (default: 60000)
    #[serde(
        default = "default_max_delay",
        rename = "max_delay_ms",
        with = "duration_ms_serde"
    )]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Checkpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Write periodic checkpoints (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Completed rows between checkpoints (default: 100)
    #[serde(default = "default_checkpoint_interval")]
    pub interval: usize,

    /// Directory for checkpoint artifacts (default: the output file's directory)
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Delete a checkpoint once a newer one is durable (default: false, keep all until success)
    #[serde(default)]
    pub prune_superseded: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_checkpoint_interval(),
            directory: None,
            prune_superseded: false,
        }
    }
}

/// Post-hoc output filter
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputFilter {
    /// Column to test (default: the label column)
    #[serde(default)]
    pub column: Option<String>,

    /// Values to keep; every other row is dropped from the final output
    pub keep: Vec<String>,
}

/// Output configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Column receiving the classification label (default: "Status")
    #[serde(default = "default_label_column")]
    pub label_column: String,

    /// Additional augmentation columns, in output order
    #[serde(default)]
    pub extra_columns: Vec<String>,

    /// Keep only rows whose value is listed (applied to the complete result set)
    #[serde(default)]
    pub filter: Option<OutputFilter>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            label_column: default_label_column(),
            extra_columns: vec![],
            filter: None,
        }
    }
}

/// A column that must be present before an external call is worth making
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequiredColumn {
    /// Column name (e.g., "Email")
    pub name: String,

    /// Label for rows where the column is absent or blank (default: "Missing <name>")
    #[serde(default)]
    pub missing_label: Option<String>,

    /// Optional regex the value must match
    #[serde(default)]
    pub pattern: Option<String>,

    /// Label for rows whose value does not match `pattern` (default: "Invalid <name>")
    #[serde(default)]
    pub invalid_label: Option<String>,
}

impl RequiredColumn {
    /// A required column with default labels and no pattern
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            missing_label: None,
            pattern: None,
            invalid_label: None,
        }
    }

    /// Label applied when the value is blank
    pub fn missing_label(&self) -> String {
        self.missing_label
            .clone()
            .unwrap_or_else(|| format!("Missing {}", self.name))
    }

    /// Label applied when the value fails the pattern
    pub fn invalid_label(&self) -> String {
        self.invalid_label
            .clone()
            .unwrap_or_else(|| format!("Invalid {}", self.name))
    }
}

/// Local classification configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationConfig {
    /// Columns checked before calling the provider
    #[serde(default)]
    pub required_columns: Vec<RequiredColumn>,

    /// Label written for rows whose call failed (default: "Error")
    #[serde(default = "default_error_label")]
    pub error_label: String,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            required_columns: vec![],
            error_label: default_error_label(),
        }
    }
}

/// Generic JSON-over-HTTP provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Endpoint URL
    pub endpoint: String,

    /// Input column whose value keys the request (e.g., "Email")
    pub key_column: String,

    /// Query parameter carrying the key value (default: "q")
    #[serde(default = "default_query_param")]
    pub query_param: String,

    /// Query parameter carrying the credential secret (default: "api_key")
    #[serde(default = "default_credential_param")]
    pub credential_param: String,

    /// Credential used when not sharding
    #[serde(default)]
    pub credential: Option<Credential>,

    /// JSON pointer to the classification label in the response (default: "/result")
    #[serde(default = "default_label_pointer")]
    pub label_pointer: String,

    /// Labels counted as success; anything else is a classified failure
    #[serde(default = "default_success_labels")]
    pub success_labels: Vec<String>,

    /// Output column -> JSON pointer for additional augmentation fields
    #[serde(default)]
    pub field_pointers: BTreeMap<String, String>,

    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ProviderConfig {
    fn validate(&self) -> Result<()> {
        if let Err(e) = url::Url::parse(&self.endpoint) {
            return Err(Error::config(
                "provider.endpoint",
                format!("invalid URL {:?}: {e}", self.endpoint),
            ));
        }
        if self.key_column.trim().is_empty() {
            return Err(Error::config("provider.key_column", "must not be empty"));
        }
        if !self.label_pointer.is_empty() && !self.label_pointer.starts_with('/') {
            return Err(Error::config(
                "provider.label_pointer",
                "must be a JSON pointer starting with '/'",
            ));
        }
        for (column, pointer) in &self.field_pointers {
            if !pointer.starts_with('/') {
                return Err(Error::config(
                    &format!("provider.field_pointers.{column}"),
                    "must be a JSON pointer starting with '/'",
                ));
            }
        }
        Ok(())
    }
}

/// One provider credential (one per shard when sharding)
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    /// Name used in logs and checkpoint names (never the secret)
    pub name: String,

    /// Secret sent to the provider
    pub secret: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl std::str::FromStr for Credential {
    type Err = String;

    /// Parse `name=secret`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, secret)) if !name.trim().is_empty() && !secret.is_empty() => Ok(Self {
                name: name.trim().to_string(),
                secret: secret.to_string(),
            }),
            _ => Err(format!("expected NAME=SECRET, got {s:?}")),
        }
    }
}

/// Sharding configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardingConfig {
    /// One shard per credential
    #[serde(default)]
    pub credentials: Vec<Credential>,

    /// Cancel the remaining shards as soon as one fails (default: false)
    #[serde(default)]
    pub cancel_siblings_on_failure: bool,

    /// Parent directory for the temporary shard workspace (default: the output's directory)
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
}

// Default value functions
fn default_delimiter() -> char {
    ','
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    5
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_checkpoint_interval() -> usize {
    100
}

fn default_label_column() -> String {
    "Status".to_string()
}

fn default_error_label() -> String {
    "Error".to_string()
}

fn default_query_param() -> String {
    "q".to_string()
}

fn default_credential_param() -> String {
    "api_key".to_string()
}

fn default_label_pointer() -> String {
    "/result".to_string()
}

fn default_success_labels() -> Vec<String> {
    vec!["Good".to_string()]
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper (milliseconds)
mod optional_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default()
            .validate()
            .expect("defaults must pass validation");
    }

    #[test]
    fn empty_json_object_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.source.chunk_size, 10_000);
        assert_eq!(config.source.delimiter, ',');
        assert_eq!(config.workers.concurrency, 5);
        assert_eq!(config.workers.call_timeout, Duration::from_secs(10));
        assert_eq!(config.checkpoint.interval, 100);
        assert_eq!(config.retry.max_attempts, 0, "retry must be off by default");
        assert_eq!(config.output.label_column, "Status");
        assert_eq!(config.classification.error_label, "Error");
        assert_eq!(
            config.rate_limit,
            RateLimitConfig::Fixed { interval_ms: 1000 }
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let json = r#"{"workers": {"concurency": 4}}"#;
        let err = serde_json::from_str::<Config>(json).unwrap_err();
        assert!(
            err.to_string().contains("unknown field"),
            "typo must be reported, got: {err}"
        );
    }

    #[test]
    fn full_config_parses_with_millisecond_durations() {
        let json = r#"{
            "source": {"delimiter": ";", "chunk_size": 500, "malformed": "fail_fast"},
            "workers": {"concurrency": 8, "call_timeout_ms": 2500, "run_timeout_ms": 60000},
            "rate_limit": {"mode": "proportional", "budget_ms": 1000},
            "retry": {"max_attempts": 2, "initial_delay_ms": 50},
            "checkpoint": {"interval": 250, "prune_superseded": true},
            "output": {"label_column": "Verdict", "extra_columns": ["Score"],
                       "filter": {"keep": ["Good"]}},
            "classification": {"required_columns": [
                {"name": "Email", "missing_label": "No email", "pattern": "@"}
            ]},
            "provider": {"endpoint": "https://verify.example.com/v1/check",
                         "key_column": "Email", "query_param": "email",
                         "field_pointers": {"Score": "/score"}},
            "sharding": {"credentials": [{"name": "a", "secret": "k1"}],
                         "cancel_siblings_on_failure": true}
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.source.delimiter, ';');
        assert_eq!(config.source.malformed, MalformedPolicy::FailFast);
        assert_eq!(config.workers.call_timeout, Duration::from_millis(2500));
        assert_eq!(config.workers.run_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(
            config.rate_limit,
            RateLimitConfig::Proportional { budget_ms: 1000 }
        );
        assert!(config.checkpoint.prune_superseded);
        assert_eq!(config.output.extra_columns, vec!["Score".to_string()]);
        assert_eq!(
            config.classification.required_columns[0].missing_label(),
            "No email"
        );
        assert_eq!(config.sharding.credentials.len(), 1);
        assert!(config.sharding.cancel_siblings_on_failure);
    }

    #[test]
    fn proportional_interval_rounds_up() {
        let config = RateLimitConfig::Proportional { budget_ms: 1000 };

        assert_eq!(config.effective_interval(3), Duration::from_millis(334));
        assert_eq!(config.effective_interval(8), Duration::from_millis(125));
        assert_eq!(
            config.effective_interval(0),
            Duration::from_millis(1000),
            "zero workers must not divide by zero"
        );
    }

    #[test]
    fn fixed_interval_ignores_concurrency() {
        let config = RateLimitConfig::default();
        assert_eq!(config.effective_interval(1), Duration::from_secs(1));
        assert_eq!(config.effective_interval(16), Duration::from_secs(1));
    }

    #[test]
    fn unlimited_mode_parses_without_interval() {
        let config: RateLimitConfig = serde_json::from_str(r#"{"mode": "unlimited"}"#).unwrap();
        assert_eq!(config.effective_interval(4), Duration::ZERO);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.workers.concurrency = 0;

        match config.validate().unwrap_err() {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("workers.concurrency")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_bad_required_column_pattern() {
        let mut config = Config::default();
        config.classification.required_columns.push(RequiredColumn {
            pattern: Some("([unclosed".into()),
            ..RequiredColumn::new("Email")
        });

        match config.validate().unwrap_err() {
            Error::Config { key, message } => {
                assert_eq!(
                    key.as_deref(),
                    Some("classification.required_columns[0].pattern")
                );
                assert!(message.contains("invalid regex"), "got: {message}");
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_non_ascii_delimiter() {
        let mut config = Config::default();
        config.source.delimiter = '§';
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_filter() {
        let mut config = Config::default();
        config.output.filter = Some(OutputFilter {
            column: None,
            keep: vec![],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_provider_with_bad_endpoint() {
        let mut config = Config::default();
        config.provider = Some(ProviderConfig {
            endpoint: "not a url".into(),
            key_column: "Email".into(),
            query_param: default_query_param(),
            credential_param: default_credential_param(),
            credential: None,
            label_pointer: default_label_pointer(),
            success_labels: default_success_labels(),
            field_pointers: BTreeMap::new(),
            headers: BTreeMap::new(),
        });

        match config.validate().unwrap_err() {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("provider.endpoint")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn required_column_default_labels() {
        let column = RequiredColumn::new("Website");
        assert_eq!(column.missing_label(), "Missing Website");
        assert_eq!(column.invalid_label(), "Invalid Website");
    }

    #[test]
    fn credential_parses_name_equals_secret() {
        let credential: Credential = "primary=abc=123".parse().unwrap();
        assert_eq!(credential.name, "primary");
        assert_eq!(credential.secret, "abc=123", "only the first '=' splits");

        assert!("no-separator".parse::<Credential>().is_err());
        assert!("=secret".parse::<Credential>().is_err());
        assert!("name=".parse::<Credential>().is_err());
    }

    #[test]
    fn credential_debug_redacts_secret() {
        let credential: Credential = "primary=topsecret".parse().unwrap();
        let debug = format!("{credential:?}");
        assert!(!debug.contains("topsecret"), "secret leaked: {debug}");
        assert!(debug.contains("primary"));
    }

    #[test]
    fn from_file_reports_unreadable_path() {
        let err = Config::from_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, Error::Config { .. }), "got {err:?}");
    }

    #[test]
    fn from_file_loads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"workers": {"concurrency": 0}}"#).unwrap();

        let err = Config::from_file(&path).unwrap_err();
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("workers.concurrency")),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }
}
