//! Global rate limiting for delivery API calls.
//!
//! A token bucket with a capacity of one token, refilled at the configured
//! rate. With a single token the bucket reduces to "next free slot": every
//! admission reserves the slot after the previous one, so consecutive calls
//! are spaced by at least `1 / rate` across all concurrent senders.
//!
//! ```text
//! Rate limit: 4 req/sec, burst: 1
//! - first call admitted immediately
//! - then one admission every 250ms, regardless of how many tasks wait
//! - after an idle period the next call is again immediate
//! ```

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Shared token-bucket limiter with burst 1.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Admit `rate` calls per second. A rate of zero is clamped to one.
    pub fn per_second(rate: u32) -> Self {
        Self::with_interval(Duration::from_secs(1) / rate.max(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Minimum spacing between two admissions.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until one call may proceed.
    ///
    /// The slot is reserved before sleeping, so waiters are admitted in the
    /// order they reached the limiter.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };

        if slot > Instant::now() {
            sleep_until(slot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_interval_from_rate() {
        assert_eq!(RateLimiter::per_second(1).interval(), Duration::from_secs(1));
        assert_eq!(RateLimiter::per_second(4).interval(), Duration::from_millis(250));
        assert_eq!(RateLimiter::per_second(0).interval(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_immediate() {
        let limiter = RateLimiter::per_second(2);
        let start = Instant::now();

        limiter.acquire().await;

        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_are_spaced() {
        let limiter = Arc::new(RateLimiter::per_second(4));
        let mut handles = Vec::new();

        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        for pair in admitted.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
        assert!(admitted[5] - admitted[0] >= Duration::from_millis(1250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_limiter_does_not_accumulate_burst() {
        let limiter = RateLimiter::per_second(10);

        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;

        // only one token after idling, the second call waits a full interval
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(150));
    }
}
