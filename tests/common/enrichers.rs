//! Mock enrichers

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use batch_enrich::{EnrichError, Enricher, Enrichment, Row};
use tokio_util::sync::CancellationToken;

/// Deterministic classification by email domain
///
/// `.io` addresses are `Good`, anything else is `Bad`; the domain is returned
/// in the `Domain` field.
pub fn classify(row: &Row) -> Enrichment {
    let email = row.get("Email").unwrap_or_default();
    let domain = email.rsplit('@').next().unwrap_or_default();
    if domain.ends_with(".io") {
        Enrichment::success("Good").with_field("Domain", domain)
    } else {
        Enrichment::failure("Bad").with_field("Domain", domain)
    }
}

/// Counts calls and classifies with [`classify`]
#[derive(Default)]
pub struct CountingEnricher {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingEnricher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enricher for CountingEnricher {
    async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(classify(row))
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Fails with a network error for one named row
pub struct FailingRowEnricher {
    pub failing_name: String,
}

#[async_trait]
impl Enricher for FailingRowEnricher {
    async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
        if row.get("Name") == Some(self.failing_name.as_str()) {
            return Err(EnrichError::Network("connection reset by peer".to_string()));
        }
        Ok(classify(row))
    }

    fn name(&self) -> &'static str {
        "failing-row"
    }
}

/// Panics for one named row
pub struct PanickingEnricher {
    pub panicking_name: String,
}

#[async_trait]
impl Enricher for PanickingEnricher {
    async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
        if row.get("Name") == Some(self.panicking_name.as_str()) {
            panic!("provider client bug");
        }
        Ok(classify(row))
    }

    fn name(&self) -> &'static str {
        "panicking"
    }
}

/// Cancels a token during its n-th call (1-based), then keeps classifying
pub struct CancellingEnricher {
    calls: AtomicUsize,
    after: usize,
    token: CancellationToken,
}

impl CancellingEnricher {
    pub fn new(after: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            after,
            token,
        })
    }
}

#[async_trait]
impl Enricher for CancellingEnricher {
    async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.after {
            self.token.cancel();
        }
        Ok(classify(row))
    }

    fn name(&self) -> &'static str {
        "cancelling"
    }
}

/// Waits until `gate` reaches `target` calls elsewhere, then cancels `token`
///
/// Used to stop one shard only after its siblings have enriched every row.
pub struct GatedCancelEnricher {
    pub gate: Arc<AtomicUsize>,
    pub target: usize,
    pub token: CancellationToken,
}

#[async_trait]
impl Enricher for GatedCancelEnricher {
    async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
        while self.gate.load(Ordering::SeqCst) < self.target {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.token.cancel();
        Ok(classify(row))
    }

    fn name(&self) -> &'static str {
        "gated-cancel"
    }
}

/// Classifies with [`classify`] after `delay` and bumps a shared counter after each call
pub struct GateEnricher {
    pub gate: Arc<AtomicUsize>,
    pub delay: Duration,
}

#[async_trait]
impl Enricher for GateEnricher {
    async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let enrichment = classify(row);
        self.gate.fetch_add(1, Ordering::SeqCst);
        Ok(enrichment)
    }

    fn name(&self) -> &'static str {
        "gate"
    }
}

/// Holds every call until `gate` reaches `target`, then classifies
pub struct WaitingEnricher {
    pub gate: Arc<AtomicUsize>,
    pub target: usize,
}

#[async_trait]
impl Enricher for WaitingEnricher {
    async fn enrich(&self, row: &Row) -> Result<Enrichment, EnrichError> {
        while self.gate.load(Ordering::SeqCst) < self.target {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(classify(row))
    }

    fn name(&self) -> &'static str {
        "waiting"
    }
}
