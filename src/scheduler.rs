//! Bounded-concurrency execution over a list of independent work items.
//!
//! `run_bounded` runs up to `workers` items at a time. Work assignment is a
//! shared claim cursor over the item indices: each worker repeatedly takes
//! the next unclaimed index until the list is exhausted. Item durations are
//! already evened out by the shared rate limiter upstream, so nothing fancier
//! than a cursor is needed.
//!
//! Each item's execution is fully isolated — a failing item is recorded and
//! its siblings keep running.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::join_all;

/// Failures collected from one scheduling pass, by item index.
pub type Failures = Vec<(usize, anyhow::Error)>;

/// Run `count` work items with at most `workers` in flight at once.
///
/// The callback receives the claimed item index. The worker futures run
/// concurrently on the calling task, so the callback may freely borrow from
/// the caller's scope.
pub async fn run_bounded<F, Fut>(count: usize, workers: usize, run: F) -> Failures
where
    F: Fn(usize) -> Fut + Sync,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let cursor = AtomicUsize::new(0);
    let failures = Mutex::new(Vec::new());
    let workers = workers.max(1);

    let worker_loops = (0..workers).map(|_| {
        let cursor = &cursor;
        let failures = &failures;
        let run = &run;
        async move {
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= count {
                    break;
                }
                if let Err(err) = run(index).await {
                    failures
                        .lock()
                        .expect("failure list poisoned")
                        .push((index, err));
                }
            }
        }
    });

    join_all(worker_loops).await;
    failures.into_inner().expect("failure list poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_worker_limit() {
        let in_flight = AtomicUsize::new(0);
        let high_water = AtomicUsize::new(0);
        let completed = AtomicUsize::new(0);

        let failures = run_bounded(10, 3, |_| async {
            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(failures.is_empty());
        assert_eq!(completed.load(Ordering::SeqCst), 10);
        let peak = high_water.load(Ordering::SeqCst);
        assert!(peak <= 3, "had {} items in flight", peak);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_siblings() {
        let completed = AtomicUsize::new(0);
        let completed = &completed;

        let failures = run_bounded(8, 2, |index| async move {
            if index % 3 == 0 {
                anyhow::bail!("item {} failed", index);
            }
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        // 0, 3, 6 fail; the other five complete.
        assert_eq!(failures.len(), 3);
        assert_eq!(completed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_every_item_claimed_exactly_once() {
        let sum = AtomicUsize::new(0);
        let sum = &sum;

        let failures = run_bounded(100, 7, |index| async move {
            sum.fetch_add(index, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(failures.is_empty());
        assert_eq!(sum.load(Ordering::SeqCst), (0..100).sum::<usize>());
    }

    #[tokio::test]
    async fn test_empty_list() {
        let failures = run_bounded(0, 4, |_| async { Ok(()) }).await;
        assert!(failures.is_empty());
    }
}
