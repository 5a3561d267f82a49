//! Enrichment functions and the row-processing boundary
//!
//! An [`Enricher`] turns one row into a classification by calling an external
//! provider. [`RowProcessor`] wraps an enricher with everything a pipeline
//! needs around the call: local required-column checks, rate limiting, the
//! per-call timeout, panic capture and optional retry. Whatever the enricher
//! does, `RowProcessor::process` returns a [`RowResult`]; row-level failures
//! never escape it.

pub mod http;

pub use http::{HttpEnricher, HttpEnricherFactory};

use async_trait::async_trait;
use futures::FutureExt;
use regex::Regex;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Credential, RetryConfig};
use crate::error::{EnrichError, Error, Result};
use crate::rate_limiter::RateLimiter;
use crate::retry::with_retry;
use crate::types::{Ordinal, Row, RowResult, TerminalState};

/// Classification reported by an enricher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The provider confirmed the row
    Success,
    /// The provider classified the row as failing
    ClassifiedFailure,
}

/// What an enricher learned about a row
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    /// Success or classified failure
    pub outcome: Outcome,
    /// Value for the label column
    pub label: String,
    /// Additional augmentation columns
    pub fields: BTreeMap<String, String>,
}

impl Enrichment {
    /// A successful classification
    pub fn success(label: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            label: label.into(),
            fields: BTreeMap::new(),
        }
    }

    /// A failing classification
    pub fn failure(label: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::ClassifiedFailure,
            label: label.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add an augmentation field
    #[must_use]
    pub fn with_field(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }
}

/// A pluggable enrichment function
///
/// Implementations call one external provider per row. They may be called
/// concurrently from several workers, so they must be `Send + Sync`. Errors
/// are row-level: returning `Err` marks only that row as failed.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use batch_enrich::enrich::{Enricher, Enrichment};
/// use batch_enrich::error::EnrichError;
/// use batch_enrich::types::Row;
///
/// struct DomainCheck;
///
/// #[async_trait]
/// impl Enricher for DomainCheck {
///     async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
///         match row.get("Website") {
///             Some(site) if site.ends_with(".com") => Ok(Enrichment::success("Valid")),
///             _ => Ok(Enrichment::failure("Invalid")),
///         }
///     }
///
///     fn name(&self) -> &'static str {
///         "domain-check"
///     }
/// }
/// ```
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Classify and augment one row
    async fn enrich(&self, row: &Row) -> std::result::Result<Enrichment, EnrichError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Builds one enricher per credential for sharded runs
pub trait EnricherFactory: Send + Sync {
    /// Create an enricher bound to `credential`
    fn build(&self, credential: &Credential) -> Result<Arc<dyn Enricher>>;
}

impl<F> EnricherFactory for F
where
    F: Fn(&Credential) -> Result<Arc<dyn Enricher>> + Send + Sync,
{
    fn build(&self, credential: &Credential) -> Result<Arc<dyn Enricher>> {
        self(credential)
    }
}

/// A required column with its compiled pattern
struct Requirement {
    column: String,
    missing_label: String,
    pattern: Option<(Regex, String)>,
}

/// The enrichment boundary: turns every row into a [`RowResult`]
///
/// For each row:
/// 1. Required columns are checked locally; a blank or non-matching value
///    classifies the row without any external call
/// 2. Otherwise a rate-limiter slot is acquired and the enricher is called
///    under the per-call timeout, with panics captured
/// 3. Transient failures are retried when `RetryConfig::max_attempts > 0`;
///    every attempt takes its own rate-limiter slot
/// 4. Any remaining error becomes an `UnrecoverableError` result labelled
///    with the configured error label
///
/// Once the cancellation token fires, no further call is dispatched: a row
/// still waiting for its slot gives up and stays pending.
pub struct RowProcessor {
    enricher: Arc<dyn Enricher>,
    limiter: RateLimiter,
    cancel: CancellationToken,
    call_timeout: Duration,
    retry: RetryConfig,
    requirements: Vec<Requirement>,
    error_label: String,
}

impl RowProcessor {
    /// Create a processor from configuration
    ///
    /// Fails only if a required-column pattern does not compile.
    pub fn new(config: &Config, enricher: Arc<dyn Enricher>, limiter: RateLimiter) -> Result<Self> {
        let requirements = config
            .classification
            .required_columns
            .iter()
            .enumerate()
            .map(|(i, required)| {
                let pattern = match &required.pattern {
                    Some(pattern) => {
                        let regex = Regex::new(pattern).map_err(|e| {
                            Error::config(
                                &format!("classification.required_columns[{i}].pattern"),
                                format!("invalid regex: {e}"),
                            )
                        })?;
                        Some((regex, required.invalid_label()))
                    }
                    None => None,
                };
                Ok(Requirement {
                    column: required.name.clone(),
                    missing_label: required.missing_label(),
                    pattern,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            enricher,
            limiter,
            cancel: CancellationToken::new(),
            call_timeout: config.workers.call_timeout,
            retry: config.retry.clone(),
            requirements,
            error_label: config.classification.error_label.clone(),
        })
    }

    /// Stop dispatching calls once `token` is cancelled
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The limiter every call goes through
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Name of the wrapped enricher
    pub fn enricher_name(&self) -> &'static str {
        self.enricher.name()
    }

    /// Label for a row that fails a required-column check, if any
    pub fn classify_locally(&self, row: &Row) -> Option<String> {
        for requirement in &self.requirements {
            let value = row.get(&requirement.column).unwrap_or("").trim();
            if value.is_empty() {
                return Some(requirement.missing_label.clone());
            }
            if let Some((regex, invalid_label)) = &requirement.pattern
                && !regex.is_match(value)
            {
                return Some(invalid_label.clone());
            }
        }
        None
    }

    /// Bring one row to a terminal state
    ///
    /// Returns `None` when the run was cancelled before the row's call could
    /// be dispatched. Calls already dispatched always finish.
    pub async fn process(&self, ordinal: Ordinal, row: Row) -> Option<RowResult> {
        if let Some(label) = self.classify_locally(&row) {
            tracing::debug!(ordinal = ordinal.0, label = %label, "row classified locally");
            return Some(RowResult {
                ordinal,
                row,
                state: TerminalState::ClassifiedFailure,
                label,
                fields: BTreeMap::new(),
                calls: 0,
                error: None,
            });
        }

        let calls = AtomicU32::new(0);
        let outcome = with_retry(&self.retry, || self.attempt(&row, &calls)).await;
        let calls = calls.load(Ordering::Relaxed);

        let result = match outcome {
            Ok(None) => {
                tracing::debug!(ordinal = ordinal.0, calls, "cancelled before dispatch, row left pending");
                return None;
            }
            Ok(Some(enrichment)) => RowResult {
                ordinal,
                row,
                state: match enrichment.outcome {
                    Outcome::Success => TerminalState::Success,
                    Outcome::ClassifiedFailure => TerminalState::ClassifiedFailure,
                },
                label: enrichment.label,
                fields: enrichment.fields,
                calls,
                error: None,
            },
            Err(e) => {
                tracing::warn!(
                    ordinal = ordinal.0,
                    enricher = self.enricher.name(),
                    calls,
                    error = %e,
                    "row enrichment failed"
                );
                RowResult {
                    ordinal,
                    row,
                    state: TerminalState::UnrecoverableError,
                    label: self.error_label.clone(),
                    fields: BTreeMap::new(),
                    calls,
                    error: Some(e.to_string()),
                }
            }
        };
        Some(result)
    }

    /// One call, or `Ok(None)` if the run is cancelled while waiting for a slot
    async fn attempt(
        &self,
        row: &Row,
        calls: &AtomicU32,
    ) -> std::result::Result<Option<Enrichment>, EnrichError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            _ = self.limiter.acquire() => {}
        }
        calls.fetch_add(1, Ordering::Relaxed);

        let call = AssertUnwindSafe(self.enricher.enrich(row)).catch_unwind();
        match tokio::time::timeout(self.call_timeout, call).await {
            Err(_) => Err(EnrichError::Timeout(self.call_timeout)),
            Ok(Err(panic)) => Err(EnrichError::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(result)) => result.map(Some),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
