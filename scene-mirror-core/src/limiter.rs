//! Bounded-parallel execution
//!
//! [`ConcurrencyLimiter`] plays two roles. `run_all` / `run_settled` fan a batch of
//! operations out with at most `limit` polled at once and hand results back in input
//! order. `acquire` hands out semaphore permits; the remote layer holds one per call so
//! nested fan-outs still never exceed `limit` calls in flight overall.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    limit: usize,
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    /// A limit of 0 is treated as 1.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for one of the `limit` call slots.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed, so acquisition only fails if that invariant breaks.
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("limiter semaphore is never closed"),
        }
    }

    /// Run every operation, stopping at the first error.
    ///
    /// On error the remaining operations are dropped, which cancels them; none is left
    /// running unobserved.
    pub async fn run_all<I, F, T, E>(&self, ops: I) -> Result<Vec<T>, E>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
    {
        let ops: Vec<F> = ops.into_iter().collect();
        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(ops.len()).collect();

        let mut running = stream::iter(
            ops.into_iter()
                .enumerate()
                .map(|(index, op)| async move { (index, op.await) }),
        )
        .buffer_unordered(self.limit);

        while let Some((index, result)) = running.next().await {
            slots[index] = Some(result?);
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Run every operation to completion regardless of sibling failures.
    pub async fn run_settled<I, F, T, E>(&self, ops: I) -> Vec<Result<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
    {
        self.run_settled_with(ops, |_, _| {}).await
    }

    /// [`run_settled`](Self::run_settled), also handing each result to `on_ready` in input
    /// order as soon as every earlier result is in.
    pub async fn run_settled_with<I, F, T, E, C>(
        &self,
        ops: I,
        mut on_ready: C,
    ) -> Vec<Result<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
        C: FnMut(usize, &Result<T, E>),
    {
        let ops: Vec<F> = ops.into_iter().collect();
        let mut slots: Vec<Option<Result<T, E>>> =
            std::iter::repeat_with(|| None).take(ops.len()).collect();
        let mut cursor = 0;

        let mut running = stream::iter(
            ops.into_iter()
                .enumerate()
                .map(|(index, op)| async move { (index, op.await) }),
        )
        .buffer_unordered(self.limit);

        while let Some((index, result)) = running.next().await {
            slots[index] = Some(result);
            while let Some(Some(ready)) = slots.get(cursor) {
                on_ready(cursor, ready);
                cursor += 1;
            }
        }

        slots.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Gauge {
        now: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Self {
            Self {
                now: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        async fn track<T>(&self, delay_ms: u64, value: T) -> T {
            let n = self.now.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(n, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            self.now.fetch_sub(1, Ordering::SeqCst);
            value
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_preserves_input_order() {
        let limiter = ConcurrencyLimiter::new(3);
        let gauge = Gauge::new();
        // Later items finish first.
        let ops = (0..8u64).map(|i| {
            let gauge = &gauge;
            async move { Ok::<_, String>(gauge.track(80 - i * 10, i).await) }
        });

        let results = limiter.run_all(ops).await.unwrap();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_fails_fast() {
        let limiter = ConcurrencyLimiter::new(2);
        let started = AtomicUsize::new(0);
        let ops = (0..10u64).map(|i| {
            let started = &started;
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                if i == 1 {
                    Err(format!("item {i} failed"))
                } else {
                    Ok(i)
                }
            }
        });

        let err = limiter.run_all(ops).await.unwrap_err();
        assert_eq!(err, "item 1 failed");
        // The batch stopped long before all ten were started.
        assert!(started.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_settled_reports_every_item() {
        let limiter = ConcurrencyLimiter::new(4);
        let ops = (0..6u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(10 * (6 - i))).await;
            if i % 2 == 0 {
                Ok(i)
            } else {
                Err(i)
            }
        });

        let results = limiter.run_settled(ops).await;
        assert_eq!(results.len(), 6);
        for (i, result) in results.into_iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(result, Ok(i as u64));
            } else {
                assert_eq!(result, Err(i as u64));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_settled_with_hands_out_ready_prefix() {
        let limiter = ConcurrencyLimiter::new(4);
        let start = tokio::time::Instant::now();
        let delays = [5u64, 50, 10, 20];
        let ops = delays.iter().map(|&ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<u64, ()>(ms)
        });

        let mut seen = Vec::new();
        let results = limiter
            .run_settled_with(ops, |index, result| {
                seen.push((index, *result, start.elapsed().as_millis() as u64));
            })
            .await;

        assert_eq!(results.len(), 4);
        let order: Vec<(usize, Result<u64, ()>)> = seen.iter().map(|&(i, r, _)| (i, r)).collect();
        assert_eq!(order, vec![(0, Ok(5)), (1, Ok(50)), (2, Ok(10)), (3, Ok(20))]);
        // Index 0 goes out on its own; the rest wait for index 1.
        assert!(seen[0].2 < 50);
        assert!(seen[1..].iter().all(|&(_, _, at)| at >= 50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permits_bound_nested_callers() {
        let limiter = ConcurrencyLimiter::new(2);
        let gauge = Arc::new(Gauge::new());

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let gauge = gauge.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                gauge.track(10, ()).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_limit_clamped() {
        assert_eq!(ConcurrencyLimiter::new(0).limit(), 1);
    }
}
