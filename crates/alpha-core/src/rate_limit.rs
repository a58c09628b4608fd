//! Token-bucket limiter on outgoing platform requests.
//!
//! Tokens refill continuously at `requests_per_minute / 60` per second up to
//! `burst`. Time is read from `tokio::time::Instant`, so paused-clock tests
//! see refills as virtual time advances.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared request limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A limiter that starts full.
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_rate: f64::from(requests_per_minute.max(1)) / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available now. Otherwise returns how long
    /// until one will be.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
