//! Request spacing for provider calls
//!
//! The RateLimiter enforces a minimum interval between dispatches for every
//! worker that shares it, no matter how many workers there are.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Dispatch limiter shared by all workers of one pipeline
///
/// # Algorithm
///
/// - Each caller reserves the next free dispatch slot
/// - Slots are at least `interval` apart, so over any window of `interval * k`
///   at most `k` dispatches happen
/// - The reservation is made under a fair (FIFO) async mutex, so callers are
///   served in arrival order; the mutex is released before sleeping
///
/// An interval of zero is the unlimited fast path: `acquire` never waits.
///
/// Cloning shares state. Use one limiter per credential: two limiters never
/// coordinate with each other.
#[derive(Clone)]
pub struct RateLimiter {
    /// Minimum spacing in nanoseconds (0 = unlimited)
    interval_nanos: Arc<AtomicU64>,
    /// Earliest instant the next dispatch may happen
    next_slot: Arc<Mutex<Option<Instant>>>,
    /// Dispatches granted so far
    dispatched: Arc<AtomicU64>,
}

impl RateLimiter {
    /// Create a limiter with a fixed minimum interval between dispatches
    ///
    /// # Examples
    ///
    /// ```
    /// use batch_enrich::rate_limiter::RateLimiter;
    /// use std::time::Duration;
    ///
    /// // One call per second
    /// let limiter = RateLimiter::new(Duration::from_secs(1));
    /// assert_eq!(limiter.interval(), Duration::from_secs(1));
    /// ```
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_nanos: Arc::new(AtomicU64::new(duration_nanos(interval))),
            next_slot: Arc::new(Mutex::new(None)),
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A limiter that never waits
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Build a limiter from configuration for a pool of `concurrency` workers
    #[must_use]
    pub fn from_config(config: &RateLimitConfig, concurrency: usize) -> Self {
        Self::new(config.effective_interval(concurrency))
    }

    /// Change the interval; takes effect for the next reservation
    pub fn set_interval(&self, interval: Duration) {
        self.interval_nanos
            .store(duration_nanos(interval), Ordering::SeqCst);
    }

    /// Current minimum interval between dispatches
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Relaxed))
    }

    /// Whether this limiter never waits
    pub fn is_unlimited(&self) -> bool {
        self.interval().is_zero()
    }

    /// Number of dispatches granted so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Wait for the next dispatch slot
    ///
    /// Cancel-safe: dropping the future while it sleeps forfeits the reserved
    /// slot, which only ever makes later dispatches more conservative.
    pub async fn acquire(&self) {
        let interval = self.interval();

        // Fast path: unlimited
        if interval.is_zero() {
            self.dispatched.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let (slot, now) = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + interval);
            (slot, now)
        };

        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Acquire a slot, then run `op` and return its output unchanged
    pub async fn run<F, Fut, T>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        op().await
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("interval", &self.interval())
            .field("dispatched", &self.dispatched())
            .finish()
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
