//! Steady-state pacing between consecutive pages of one partition.
//!
//! Independent of retry waits: a page that needed three attempts is still
//! followed by one inter-page delay, not three.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use harvest_core::throttle::ThrottleConfig;
//!
//! // 2 seconds between pages, plus up to 750ms of jitter
//! let config = ThrottleConfig::new(Duration::from_secs(2))
//!     .with_jitter(Duration::from_millis(750));
//! assert!(config.effective_delay() >= Duration::from_secs(2));
//! ```

use std::time::Duration;

use crate::clock::Clock;
use crate::util::rand_jitter_ms;

/// Configuration for inter-page pacing.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between two page requests of the same partition.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    ///
    /// Set to `Duration::ZERO` to disable.
    pub jitter: Duration,
}

impl ThrottleConfig {
    /// Create a new config with the given delay and no jitter.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    /// Add random jitter (uniform [0, jitter]) on top of the base delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Compute the effective delay for a single wait (delay + random jitter).
    pub fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter_ms = rand_jitter_ms(self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for ThrottleConfig {
    /// 1 second delay, 500ms jitter.
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        }
    }
}

/// Paces one walker. Not shared: each partition walk owns its own pacer.
#[derive(Debug, Clone)]
pub struct PagePacer<C: Clock> {
    config: ThrottleConfig,
    clock: C,
    last_page: Option<std::time::Instant>,
}

impl<C: Clock> PagePacer<C> {
    pub fn new(config: ThrottleConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            last_page: None,
        }
    }

    /// Wait until the inter-page delay since the previous page has elapsed,
    /// then record now as the previous page time. The first call never waits.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_page {
            let required = self.config.effective_delay();
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < required {
                let sleep_duration = required - elapsed;
                tracing::debug!(sleep_ms = %sleep_duration.as_millis(), "Pacing next page");
                self.clock.sleep(sleep_duration).await;
            }
        }
        self.last_page = Some(self.clock.now());
    }
}
