//! Classification-aware retry around a single upstream request.
//!
//! | Outcome | Wait before next attempt |
//! |---|---|
//! | 429 | `min(max_delay, base_delay · 2^n) + jitter`, never below the previous wait |
//! | 403 | `forbidden_step · n`; pool rotation and cooldown at `forbidden_threshold` |
//! | 5xx | exponential, at most `server_max_attempts` tries |
//! | transport / timeout | fixed `transport_delay` |
//! | auth failure, other 4xx | returned immediately |

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::clock::Clock;
use crate::egress::{EgressIdentity, EgressPool};
use crate::error::{HarvestError, ResponseClass};
use crate::util::rand_jitter_ms;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per call, across every retryable class.
    pub max_attempts: u32,
    /// Attempts per call once 5xx responses are involved.
    pub server_max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on the exponential component.
    pub max_delay: Duration,
    /// Uniform `[0, jitter)` added to 429 and 5xx waits. Must not exceed
    /// `base_delay`; `HarvestConfig::validate` rejects larger values.
    pub jitter: Duration,
    pub transport_delay: Duration,
    pub forbidden_step: Duration,
    /// Consecutive 403s that trigger a pool rotation plus cooldown.
    pub forbidden_threshold: u32,
    pub cooldown: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            server_max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
            transport_delay: Duration::from_secs(2),
            forbidden_step: Duration::from_secs(30),
            forbidden_threshold: 3,
            cooldown: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Exponential component for the `n`-th consecutive failure (0-indexed),
    /// capped at `max_delay`.
    pub fn backoff_delay(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n).unwrap_or(u32::MAX);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    /// Stepped wait for the `n`-th consecutive 403 (1-indexed).
    pub fn forbidden_delay(&self, n: u32) -> Duration {
        self.forbidden_step.saturating_mul(n)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        delay + Duration::from_millis(rand_jitter_ms(self.jitter.as_millis() as u64))
    }
}

/// Retry wrapper shared by every walker of one process.
///
/// The consecutive-403 counter is shared on purpose: a soft block hits the
/// whole pool, so occurrences on different partitions add up.
#[derive(Clone)]
pub struct RetryPolicy<C: Clock> {
    config: RetryConfig,
    pool: EgressPool,
    clock: C,
    consecutive_forbidden: Arc<AtomicU32>,
}

impl<C: Clock> RetryPolicy<C> {
    pub fn new(config: RetryConfig, pool: EgressPool, clock: C) -> Self {
        Self {
            config,
            pool,
            clock,
            consecutive_forbidden: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn pool(&self) -> &EgressPool {
        &self.pool
    }

    /// Run `request` until it succeeds, fails non-retryably, or the attempt
    /// budget runs out (`HarvestError::ExhaustedRetries`).
    ///
    /// Each attempt gets a freshly acquired identity and is bounded by
    /// `request_timeout`; a timeout counts as a transport failure.
    pub async fn execute<T, F, Fut>(&self, mut request: F) -> Result<T, HarvestError>
    where
        F: FnMut(EgressIdentity) -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        let mut attempts = 0u32;
        let mut rate_limited = 0u32;
        let mut last_rate_wait = Duration::ZERO;
        let mut server_errors = 0u32;

        loop {
            let cooldown = self.pool.cooldown_remaining(self.clock.now());
            if !cooldown.is_zero() {
                tracing::info!(wait_ms = %cooldown.as_millis(), "Waiting out egress cooldown");
                self.clock.sleep(cooldown).await;
            }

            let identity = self.pool.acquire(self.clock.now());
            let label = identity.label().to_string();
            attempts += 1;

            let outcome =
                match tokio::time::timeout(self.config.request_timeout, request(identity)).await {
                    Ok(result) => result,
                    Err(_) => Err(HarvestError::Timeout(self.config.request_timeout.as_secs())),
                };

            let error = match outcome {
                Ok(value) => {
                    self.consecutive_forbidden.store(0, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = error.response_class();
            let wait = match class {
                ResponseClass::Fatal | ResponseClass::Rejected => return Err(error),
                ResponseClass::RateLimited => {
                    rate_limited += 1;
                    // Jitter must never make a 429 wait shorter than the last.
                    let wait = self
                        .config
                        .jittered(self.config.backoff_delay(rate_limited - 1))
                        .max(last_rate_wait);
                    last_rate_wait = wait;
                    wait
                }
                ResponseClass::Forbidden => {
                    let n = self.consecutive_forbidden.fetch_add(1, Ordering::SeqCst) + 1;
                    if n >= self.config.forbidden_threshold {
                        self.consecutive_forbidden.store(0, Ordering::SeqCst);
                        tracing::warn!(
                            identity = %label,
                            consecutive = n,
                            cooldown_secs = self.config.cooldown.as_secs(),
                            "Repeated 403, rotating egress pool and cooling down"
                        );
                        self.pool.rotate_all();
                        self.pool
                            .begin_cooldown(self.clock.now() + self.config.cooldown);
                        // The cooldown is served at the top of the loop, where
                        // every other caller of this pool observes it as well.
                        Duration::ZERO
                    } else {
                        self.config.forbidden_delay(n)
                    }
                }
                ResponseClass::Server => {
                    server_errors += 1;
                    if server_errors >= self.config.server_max_attempts {
                        return Err(self.exhausted(attempts, error));
                    }
                    self.config
                        .jittered(self.config.backoff_delay(server_errors - 1))
                }
                ResponseClass::Transport => self.config.transport_delay,
            };

            if attempts >= self.config.max_attempts {
                return Err(self.exhausted(attempts, error));
            }

            tracing::warn!(
                identity = %label,
                attempt = attempts,
                error = %error,
                wait_ms = %wait.as_millis(),
                "Request failed, retrying"
            );
            if !wait.is_zero() {
                self.clock.sleep(wait).await;
            }
        }
    }

    fn exhausted(&self, attempts: u32, last: HarvestError) -> HarvestError {
        tracing::error!(attempts, error = %last, "Retry budget exhausted");
        HarvestError::ExhaustedRetries {
            attempts,
            last: Box::new(last),
        }
    }
}
