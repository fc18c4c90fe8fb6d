//! Bounded concurrency for deferred async operations.
//!
//! [`run_limited`] drives a list of operations on the current task with at
//! most `limit` of them in flight. Results come back in input order once
//! every operation has settled, even when some of them fail.

use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::future::Future;

/// The default number of operations in flight: half the available
/// processing units, but never fewer than two.
pub fn default_limit() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 2).max(2)
}

/// Every failure of a [`run_limited`] batch, tagged with its input index.
#[derive(Debug)]
pub struct AggregateError<E> {
    total: usize,
    failures: Vec<(usize, E)>,
}

impl<E> AggregateError<E> {
    /// Failures in input order.
    pub fn failures(&self) -> &[(usize, E)] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<(usize, E)> {
        self.failures
    }

    /// Number of operations in the batch, failed or not.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl<E: fmt::Display> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} operations failed", self.failures.len(), self.total)?;
        if let Some((index, first)) = self.failures.first() {
            write!(f, "; #{}: {}", index, first)?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AggregateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|(_, e)| e as &(dyn std::error::Error + 'static))
    }
}

async fn launch<F, Fut, T, E>(index: usize, task: F) -> (usize, Result<T, E>)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    (index, task().await)
}

/// Runs `tasks` with at most `limit` in flight (see [`default_limit`] when
/// `None`; zero is treated as one).
///
/// A failing operation does not cancel the others. If any failed, the
/// aggregate error is returned after all of them have settled.
pub async fn run_limited<F, Fut, T, E>(
    tasks: Vec<F>,
    limit: Option<usize>,
) -> Result<Vec<T>, AggregateError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total = tasks.len();
    let limit = limit.unwrap_or_else(default_limit).max(1);

    let mut pending = tasks.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    let mut settled: Vec<Option<Result<T, E>>> = (0..total).map(|_| None).collect();

    for (index, task) in pending.by_ref().take(limit) {
        in_flight.push(launch(index, task));
    }

    while let Some((index, result)) = in_flight.next().await {
        settled[index] = Some(result);
        if let Some((next, task)) = pending.next() {
            in_flight.push(launch(next, task));
        }
    }

    let mut results = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (index, outcome) in settled.into_iter().enumerate() {
        match outcome {
            Some(Ok(value)) => results.push(value),
            Some(Err(e)) => failures.push((index, e)),
            None => unreachable!("operation {} never settled", index),
        }
    }

    if failures.is_empty() {
        Ok(results)
    } else {
        Err(AggregateError { total, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn timed_tasks(
        gauge: &Arc<Gauge>,
        delays_ms: &[u64],
    ) -> Vec<impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<usize, String>>>>> {
        delays_ms
            .iter()
            .copied()
            .enumerate()
            .map(|(i, delay)| {
                let gauge = gauge.clone();
                move || {
                    Box::pin(async move {
                        gauge.enter();
                        sleep(Duration::from_millis(delay)).await;
                        gauge.exit();
                        Ok(i)
                    }) as std::pin::Pin<Box<dyn Future<Output = Result<usize, String>>>>
                }
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit_and_keeps_order() {
        let gauge = Arc::new(Gauge::default());
        let tasks = timed_tasks(&gauge, &[50, 10, 30, 5, 40, 20, 15]);

        let results = run_limited(tasks, Some(3)).await.unwrap();

        assert_eq!(results, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
        assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_of_one_runs_sequentially() {
        let gauge = Arc::new(Gauge::default());
        let tasks = timed_tasks(&gauge, &[10, 10, 10]);
        let start = Instant::now();

        run_limited(tasks, Some(1)).await.unwrap();

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_above_len_launches_everything() {
        let gauge = Arc::new(Gauge::default());
        let tasks = timed_tasks(&gauge, &[100, 100, 100, 100]);
        let start = Instant::now();

        let results = run_limited(tasks, Some(10)).await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_empty_input() {
        for limit in [None, Some(0), Some(1), Some(8)] {
            let tasks: Vec<fn() -> std::future::Ready<Result<(), ()>>> = Vec::new();
            let results = run_limited(tasks, limit).await.unwrap();
            assert!(results.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_waits_for_slow_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = [(200u64, true), (1, false), (150, true)]
            .into_iter()
            .map(|(delay, ok)| {
                let finished = finished.clone();
                move || async move {
                    sleep(Duration::from_millis(delay)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    if ok {
                        Ok(delay)
                    } else {
                        Err(format!("failed after {}ms", delay))
                    }
                }
            })
            .collect();

        let err = run_limited(tasks, Some(3)).await.unwrap_err();

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(err.total(), 3);
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].0, 1);
        assert_eq!(err.to_string(), "1 of 3 operations failed; #1: failed after 1ms");
    }

    #[test]
    fn test_default_limit_is_at_least_two() {
        assert!(default_limit() >= 2);
    }
}
