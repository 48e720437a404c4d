//! Run independent units of work with bounded concurrency.
//!
//! Units are dispatched in input order, at most `concurrency` at a time.
//! Every completion is sent over one channel to a single collector, which
//! puts results back into input order. The pool is not fail-fast: a failed
//! unit never stops the others. A shutdown signal stops dispatching; units
//! already running are allowed to finish.

use std::future::Future;
use std::sync::Arc;

use imgpkg_core::error::{ImgpkgError, Result};
use tokio::sync::{mpsc, watch, Semaphore};

/// What happened to one input item.
#[derive(Debug)]
pub enum WorkOutcome<T> {
    /// The unit ran to completion (successfully or not).
    Completed(Result<T>),
    /// Shutdown was requested before the unit was dispatched.
    NotDispatched,
}

impl<T> WorkOutcome<T> {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, WorkOutcome::Completed(_))
    }
}

/// Bounded-concurrency executor for per-image work.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl WorkerPool {
    /// Create a pool; `concurrency` is clamped to at least 1.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            shutdown_rx: None,
        }
    }

    /// Stop dispatching once `shutdown_rx` turns `true`.
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_rx.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Run `work` over every item. The returned outcomes are in input order.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, work: F) -> Vec<WorkOutcome<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, Result<T>)>(total.max(1));
        let work = Arc::new(work);
        let mut dispatched = vec![false; total];

        for (idx, item) in items.into_iter().enumerate() {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // Checked after the wait so a shutdown during a full pool is honored.
            if self.is_shutdown() {
                tracing::debug!(dispatched = idx, total, "Shutdown requested, not dispatching further work");
                break;
            }

            dispatched[idx] = true;
            let work = Arc::clone(&work);
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                let result = work(item).await;
                drop(permit);
                // The collector only goes away once every sender is dropped.
                let _ = result_tx.send((idx, result)).await;
            });
        }
        drop(result_tx);

        let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
        while let Some((idx, result)) = result_rx.recv().await {
            slots[idx] = Some(result);
        }

        slots
            .into_iter()
            .zip(dispatched)
            .map(|(slot, was_dispatched)| match (slot, was_dispatched) {
                (Some(result), _) => WorkOutcome::Completed(result),
                (None, true) => WorkOutcome::Completed(Err(ImgpkgError::Other(
                    "worker task aborted before reporting a result".to_string(),
                ))),
                (None, false) => WorkOutcome::NotDispatched,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_in_input_order() {
        let pool = WorkerPool::new(4);
        // Later items finish first.
        let outcomes = pool
            .run((0..8u64).collect(), |i| async move {
                tokio::time::sleep(Duration::from_millis(40 - i * 5)).await;
                Ok(i * 10)
            })
            .await;

        let values: Vec<u64> = outcomes
            .into_iter()
            .map(|o| match o {
                WorkOutcome::Completed(Ok(v)) => v,
                other => panic!("unexpected outcome: {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[tokio::test]
    async fn test_peak_concurrency_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::new(3);
        let (flight, max) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let outcomes = pool
            .run((0..12).collect::<Vec<u32>>(), move |_| {
                let flight = Arc::clone(&flight);
                let max = Arc::clone(&max);
                async move {
                    let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(outcomes.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_not_fail_fast() {
        let pool = WorkerPool::new(2);
        let outcomes = pool
            .run(vec![1, 2, 3, 4, 5], |i| async move {
                if i % 2 == 0 {
                    Err(ImgpkgError::Other(format!("item {i} failed")))
                } else {
                    Ok(i)
                }
            })
            .await;

        let failed: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| matches!(o, WorkOutcome::Completed(Err(_))))
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(failed, vec![1, 3]);
        assert!(outcomes.iter().all(WorkOutcome::is_dispatched));
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(1).with_shutdown(shutdown_rx);

        let counter = Arc::clone(&started);
        let shutdown_tx = Arc::new(shutdown_tx);
        let trigger = Arc::clone(&shutdown_tx);
        let outcomes = pool
            .run(vec![0, 1, 2, 3], move |i| {
                let counter = Arc::clone(&counter);
                let trigger = Arc::clone(&trigger);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if i == 1 {
                        let _ = trigger.send(true);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(i)
                }
            })
            .await;

        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert!(matches!(outcomes[0], WorkOutcome::Completed(Ok(0))));
        assert!(matches!(outcomes[1], WorkOutcome::Completed(Ok(1))));
        assert!(matches!(outcomes[2], WorkOutcome::NotDispatched));
        assert!(matches!(outcomes[3], WorkOutcome::NotDispatched));
    }

    #[tokio::test]
    async fn test_zero_concurrency_clamped() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.concurrency(), 1);
        let outcomes = pool.run(vec![(); 3], |_| async { Ok(()) }).await;
        assert_eq!(outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let outcomes = WorkerPool::new(5).run(Vec::<u8>::new(), |_| async { Ok(()) }).await;
        assert!(outcomes.is_empty());
    }
}
