//! Token-bucket rate limiter for outbound requests.

use std::sync::Mutex;
use std::time::Duration;

use csx_core::Error;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `capacity` tokens, refilled continuously at `refill_per_sec`.
///
/// The bucket starts full. Waiting callers sleep without holding the lock, so
/// a waiter never blocks unrelated callers.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(refill_per_sec: f64, capacity: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            bucket: Mutex::new(Bucket { tokens: capacity, last_refill: Instant::now() }),
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
        }
    }

    /// Take `n` tokens.
    ///
    /// Without `wait`, fails immediately with `RateLimited` if they are not
    /// available. With `wait`, sleeps until they are or `timeout` elapses
    /// (`Timeout`).
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `n` is 0 or larger than the bucket capacity.
    pub async fn acquire(&self, n: u32, wait: bool, timeout: Duration) -> Result<(), Error> {
        let needed = f64::from(n);
        if n == 0 || needed > self.capacity {
            return Err(Error::InvalidInput(format!("cannot take {n} tokens from a bucket of {}", self.capacity)));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let shortfall = match self.take(needed) {
                Ok(()) => return Ok(()),
                Err(shortfall) => shortfall,
            };

            if !wait {
                return Err(Error::RateLimited(format!("{n} token(s) not available")));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!("rate limit token not available within {timeout:?}")));
            }

            // Clamp before converting: tiny rates overflow Duration.
            let refill_secs = (shortfall / self.refill_per_sec).min((deadline - now).as_secs_f64());
            tokio::time::sleep(Duration::from_secs_f64(refill_secs)).await;
        }
    }

    /// Non-waiting acquisition of `n` tokens.
    pub fn try_acquire(&self, n: u32) -> Result<(), Error> {
        let needed = f64::from(n);
        if n == 0 || needed > self.capacity {
            return Err(Error::InvalidInput(format!("cannot take {n} tokens from a bucket of {}", self.capacity)));
        }
        self.take(needed).map_err(|_| Error::RateLimited(format!("{n} token(s) not available")))
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        bucket.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Take tokens if available; otherwise report how many are missing.
    fn take(&self, needed: f64) -> Result<(), f64> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            Ok(())
        } else {
            Err(needed - bucket.tokens)
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}
