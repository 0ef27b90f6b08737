//! Engine tuning knobs.

use std::time::Duration;

use stocklock_ledger::DEFAULT_RESERVATION_MINUTES;

/// Configuration shared by the reservation engine, contention analyzer and
/// maintenance sweeper. The defaults match production tuning; tests shrink
/// the delays.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lifetime of a new reservation hold.
    pub default_reservation_minutes: i64,
    /// Retries after a retryable storage failure, beyond the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub base_retry_delay: Duration,
    /// Bounds for the random jitter added to each backoff delay.
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// How long a cached contention sample stays fresh.
    pub contention_cache_ttl: Duration,
    /// Trailing window over which pending reservations count as concurrent.
    pub contention_window: Duration,
    /// How often the background sweeper wakes up.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_reservation_minutes: DEFAULT_RESERVATION_MINUTES,
            max_retries: 3,
            base_retry_delay: Duration::from_millis(100),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(300),
            contention_cache_ttl: Duration::from_secs(30),
            contention_window: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_reservation_minutes(mut self, minutes: i64) -> Self {
        self.default_reservation_minutes = minutes;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    pub fn with_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.jitter_min = min;
        self.jitter_max = max;
        self
    }

    pub fn with_contention_cache_ttl(mut self, ttl: Duration) -> Self {
        self.contention_cache_ttl = ttl;
        self
    }

    pub fn with_contention_window(mut self, window: Duration) -> Self {
        self.contention_window = window;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Config suitable for unit tests: no backoff sleeps of visible length.
    pub fn fast() -> Self {
        Self::default()
            .with_base_retry_delay(Duration::from_millis(1))
            .with_jitter(Duration::ZERO, Duration::from_millis(1))
            .with_sweep_interval(Duration::from_millis(20))
    }
}
