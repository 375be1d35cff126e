//! Time source used for every pacing, backoff and cooldown wait.
//!
//! Production code uses [`SystemClock`]; tests swap in
//! [`ManualClock`](crate::testutil::ManualClock) so schedules can be asserted
//! without real delays.

use std::future::Future;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}
