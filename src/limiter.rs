//! Per-connection token bucket rate limiting.
//!
//! Every connection owns two independent buckets, one per forwarding direction. Tokens are bytes:
//! the forwarder acquires the size of each chunk before writing it, so over any window of length
//! `W` seconds at most `rate * W + burst` bytes pass in one direction.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::time::{Duration, Instant};

/// The largest number of tokens acquired at once; writes are chunked to this size.
pub const MAX_ACQUIRE: u64 = 4096;

/// The byte budgets of one connection, as set through the boundary API.
///
/// A value of zero for a rate or burst disables limiting in that direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    /// Average rate for bytes flowing from the client toward the backend, in bytes per second.
    pub send_avg: u64,
    /// Maximum accumulation for the send direction, in bytes.
    pub send_burst: u64,
    /// Average rate for bytes flowing from the backend toward the client, in bytes per second.
    pub recv_avg: u64,
    /// Maximum accumulation for the receive direction, in bytes.
    pub recv_burst: u64,
}

#[derive(Debug)]
struct BucketState {
    rate: u64,
    burst: u64,
    tokens: f64,
    updated: Instant,
}

impl BucketState {
    fn unlimited(&self) -> bool {
        self.rate == 0 || self.burst == 0
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.updated);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.rate as f64).min(self.burst as f64);
        self.updated = now;
    }
}

/// A token bucket whose parameters can be replaced at any time.
///
/// Replaced parameters take effect on the next acquisition; a waiter re-reads them after every
/// sleep, so lowering a rate also slows an acquisition that is already parked.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate,
                burst,
                tokens: burst as f64,
                updated: Instant::now(),
            }),
        }
    }

    /// Replaces the bucket parameters, clamping accumulated tokens to the new burst.
    pub fn configure(&self, rate: u64, burst: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.refill();
        state.rate = rate;
        state.burst = burst;
        state.tokens = state.tokens.min(burst as f64);
    }

    /// Removes `amount` tokens from the bucket, sleeping until enough have replenished.
    ///
    /// Amounts larger than the burst are satisfied in burst-sized installments.
    pub async fn acquire(&self, amount: u64) {
        let mut remaining = amount as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.unlimited() {
                    return;
                }
                state.refill();

                let take = remaining.min(state.tokens);
                state.tokens -= take;
                remaining -= take;
                if remaining <= 0.0 {
                    return;
                }

                let chunk = remaining.min(state.burst as f64);
                Duration::from_secs_f64(chunk / state.rate as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// The pair of buckets owned by one connection.
#[derive(Debug)]
pub struct ConnectionLimiter {
    send: TokenBucket,
    recv: TokenBucket,
}

impl ConnectionLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            send: TokenBucket::new(limit.send_avg, limit.send_burst),
            recv: TokenBucket::new(limit.recv_avg, limit.recv_burst),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(RateLimit::default())
    }

    /// Replaces both bucket parameters, effective on the next acquisition.
    pub fn set(&self, limit: RateLimit) {
        self.send.configure(limit.send_avg, limit.send_burst);
        self.recv.configure(limit.recv_avg, limit.recv_burst);
    }

    /// The bucket metering bytes flowing from the client toward the backend.
    pub fn send(&self) -> &TokenBucket {
        &self.send
    }

    /// The bucket metering bytes flowing from the backend toward the client.
    pub fn recv(&self) -> &TokenBucket {
        &self.recv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_available_immediately() {
        let bucket = TokenBucket::new(1024, 4096);
        let started = Instant::now();
        bucket.acquire(4096).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn depleted_bucket_waits_for_replenishment() {
        let bucket = TokenBucket::new(1024, 1024);
        bucket.acquire(1024).await;

        let started = Instant::now();
        bucket.acquire(512).await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_is_bounded_by_rate_plus_burst() {
        let bucket = TokenBucket::new(1024, 512);
        let started = Instant::now();

        let mut acquired = 0u64;
        while acquired < 5 * 1024 {
            bucket.acquire(256).await;
            acquired += 256;
        }

        // 5120 bytes through a 1024 B/s bucket with 512 B burst needs at least 4.5 s
        assert!(started.elapsed() >= Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn amounts_beyond_burst_are_satisfied_in_installments() {
        let bucket = TokenBucket::new(1024, 256);
        let started = Instant::now();
        bucket.acquire(2048).await;
        assert!(started.elapsed() >= Duration::from_millis(1750));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_values_disable_limiting() {
        let bucket = TokenBucket::new(0, 0);
        let started = Instant::now();
        bucket.acquire(u64::MAX).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfiguration_takes_effect_on_next_acquisition() {
        let bucket = TokenBucket::new(16, 16);
        bucket.acquire(16).await;

        // with the old rate this would take a second
        bucket.configure(16_384, 16_384);
        tokio::time::advance(Duration::from_millis(100)).await;

        let started = Instant::now();
        bucket.acquire(1024).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_pair_is_independent() {
        let limiter = ConnectionLimiter::new(RateLimit {
            send_avg: 64,
            send_burst: 64,
            recv_avg: 0,
            recv_burst: 0,
        });

        limiter.send().acquire(64).await;

        let started = Instant::now();
        limiter.recv().acquire(1 << 20).await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        limiter.send().acquire(32).await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
