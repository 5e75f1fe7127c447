//! Leaky-bucket limiter for LLM call issuance.
//!
//! One bucket per provider client. Callers wait in [`LeakyBucket::acquire`]
//! until a token drips in; the bucket never bursts beyond its capacity.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled at a steady rate.
pub struct LeakyBucket {
    capacity: f64,
    per_second: f64,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    /// `per_second` calls sustained, with at most `capacity` saved up.
    pub fn new(per_second: f64, capacity: f64) -> Self {
        Self {
            capacity,
            per_second,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until one call token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_allows_burst_up_to_capacity() {
        let bucket = LeakyBucket::new(100.0, 3.0);
        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        // Three tokens were banked; no waiting.
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_throttles_beyond_capacity() {
        let bucket = LeakyBucket::new(10.0, 1.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        // Second token drips in at ~100ms under the paused clock.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
