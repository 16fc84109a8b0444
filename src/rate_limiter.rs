//! Ingress admission control
//!
//! A token bucket shared by every ingress task. Tokens refill
//! continuously at a fixed rate up to the bucket capacity; each admitted
//! request consumes one token.

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter.
///
/// `capacity` bounds the burst size; `refill_rate` is sustained
/// tokens/second. The bucket starts full.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate: refill_rate as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refill from elapsed time, then try to take one token.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn burst_drains_then_denies() {
        let limiter = RateLimiter::new(2, 1);

        // Five simultaneous arrivals against a capacity-2 bucket.
        let outcomes: Vec<bool> = (0..5).map(|_| limiter.allow()).collect();
        assert_eq!(outcomes, vec![true, true, false, false, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_restores_admission() {
        let limiter = RateLimiter::new(2, 1);
        for _ in 0..2 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());

        // 1.5 seconds at 1 token/s buys one admission and leaves change.
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert!(limiter.tokens() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_clamp_at_capacity() {
        let limiter = RateLimiter::new(2, 1);
        tokio::time::advance(Duration::from_secs(100)).await;

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn admissions_bounded_by_capacity_plus_refill() {
        let limiter = RateLimiter::new(10, 5);
        let mut admitted = 0;

        // Hammer the bucket for 4 simulated seconds.
        for _ in 0..40 {
            for _ in 0..10 {
                if limiter.allow() {
                    admitted += 1;
                }
            }
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        // capacity + refill_rate * elapsed
        assert!(admitted as f64 <= 10.0 + 5.0 * 4.0);
    }
}
