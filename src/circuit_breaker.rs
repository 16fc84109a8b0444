//! Per-backend circuit breaker
//!
//! Counts consecutive failures and, once a threshold is reached, refuses
//! traffic until a cooldown has elapsed. There is no separate half-open
//! state: after the cooldown a trial request is let through, and another
//! failure restarts the cooldown window.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
}

/// Failure-rate gate fused into the backend's liveness check.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// True while the breaker admits traffic: either the failure count is
    /// below the threshold, or the cooldown since the last failure has
    /// fully elapsed (the trial request).
    pub fn allow(&self) -> bool {
        let state = self.state.lock();
        if state.failures >= self.threshold {
            return match state.last_failure {
                Some(last) => last.elapsed() > self.cooldown,
                None => true,
            };
        }
        true
    }

    /// A successful completion closes the breaker immediately.
    pub fn record_success(&self) {
        self.state.lock().failures = 0;
    }

    /// A failed completion bumps the count and restamps the window.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failures += 1;
        state.last_failure = Some(Instant::now());
    }

    #[cfg(test)]
    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_breaker_allows() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        assert!(breaker.allow());
    }

    #[test]
    fn failures_below_threshold_allow() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        assert_eq!(breaker.failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trips_at_threshold_and_recovers_after_cooldown() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.allow());

        // Still inside the cooldown window.
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!breaker.allow());

        // Past the cooldown a trial is permitted.
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(breaker.allow());

        // A failing trial restarts the window.
        breaker.record_failure();
        assert!(!breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_immediately() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.allow());

        breaker.record_success();
        assert!(breaker.allow());
        assert_eq!(breaker.failures(), 0);
    }
}
