//! Shared request pacing for one upstream credential.
//!
//! Every outbound call from every worker passes through one [`RateLimiter`],
//! which enforces a minimum interval between permit grants globally. The
//! implementation keeps a single "next eligible time": each `acquire`
//! reserves the earliest free slot, advances the shared value by one
//! interval, and then sleeps until its own slot arrives. This serializes the
//! *rate* of outgoing calls without serializing the calls themselves.
//!
//! Arrival order is roughly FIFO (whoever takes the mutex first gets the
//! earlier slot); no stronger fairness is needed at this request volume.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

pub struct RateLimiter {
    interval: Duration,
    next_eligible: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_eligible: Mutex::new(Instant::now()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until this caller's slot arrives, then return. Safe to call from
    /// any number of concurrent tasks.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_eligible.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.interval;
            slot
        };
        sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_single_caller_not_delayed() {
        let limiter = RateLimiter::new(Duration::from_millis(1200));
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_are_spaced_by_interval() {
        let interval = Duration::from_millis(1200);
        let limiter = Arc::new(RateLimiter::new(interval));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap());
        }
        grants.sort();

        for pair in grants.windows(2) {
            assert!(
                pair[1] - pair[0] >= interval,
                "grants {:?} apart, expected at least {:?}",
                pair[1] - pair[0],
                interval
            );
        }
        // 5 concurrent callers: the last grant lands no earlier than 4 intervals
        // after the first.
        assert!(grants[4] - grants[0] >= interval * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_is_not_banked() {
        let interval = Duration::from_millis(1000);
        let limiter = RateLimiter::new(interval);

        limiter.acquire().await;
        // Go idle for several intervals; the next two acquires must still be
        // spaced by one interval, not granted back to back.
        tokio::time::sleep(Duration::from_secs(10)).await;

        let first = Instant::now();
        limiter.acquire().await;
        assert_eq!(first.elapsed(), Duration::ZERO);

        let second = Instant::now();
        limiter.acquire().await;
        assert!(second.elapsed() >= interval);
    }
}
