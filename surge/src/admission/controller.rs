use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::curve::{owed_permits, tokens_due, MAX_TOKENS};
use crate::config::{RunClock, RunConfig};

/// Why a worker was refused permission to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("cancelled while waiting for a permit")]
    Cancelled,
    #[error("iteration limit exceeded")]
    IterationLimitExceeded,
}

/// Gates execution attempts by throughput and by total iteration count.
///
/// - Throughput: permits live in a [`Semaphore`] that starts empty. The
///   token-release loop ([`release_tokens`](Self::release_tokens)) adds permits
///   following the ramp curve; workers take one each and forget it. When the run
///   is unthrottled the semaphore is never touched and concurrency alone bounds
///   the rate.
/// - Iterations: every granted attempt bumps a shared counter with a single
///   compare-and-swap that refuses to move past the limit, so two workers
///   racing for the last iteration can never both win. Reaching the limit closes
///   the semaphore, which wakes every waiting worker with
///   [`AcquireError::IterationLimitExceeded`], and fires [`exhausted`](Self::exhausted).
#[derive(Debug)]
pub struct AdmissionController {
    throughput: f64,
    ramp_up: Duration,
    limit: Option<u64>,
    tokens: Semaphore,
    started: AtomicU64,
    released: AtomicU64,
    exhausted: CancellationToken,
}

impl AdmissionController {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            throughput: config.throughput,
            ramp_up: config.ramp_up,
            limit: config.iteration_limit(),
            tokens: Semaphore::new(0),
            started: AtomicU64::new(0),
            released: AtomicU64::new(0),
            exhausted: CancellationToken::new(),
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throughput > 0.0
    }

    /// Executions granted so far.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    /// Permits released by the token-release loop so far.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.is_cancelled()
    }

    /// Resolves once the iteration limit has been reached.
    pub fn exhausted(&self) -> WaitForCancellationFuture<'_> {
        self.exhausted.cancelled()
    }

    /// Wait for permission to execute one unit of work.
    ///
    /// Returns the 1-based iteration number on success. The caller must not
    /// execute anything when this returns an error.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<u64, AcquireError> {
        if self.is_throttled() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                permit = self.tokens.acquire() => permit,
            };
            match permit {
                // Only the release loop adds permits.
                Ok(permit) => permit.forget(),
                // The pool is only ever closed once the limit is reached.
                Err(_) => return Err(AcquireError::IterationLimitExceeded),
            }
        } else if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        self.claim_iteration()
    }

    fn claim_iteration(&self) -> Result<u64, AcquireError> {
        let Some(limit) = self.limit else {
            let previous = self
                .started
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_add(1))
                })
                .unwrap_or_else(|n| n);
            return Ok(previous.saturating_add(1));
        };

        match self
            .started
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then(|| n + 1)
            }) {
            Ok(previous) => {
                let iteration = previous + 1;
                if iteration == limit {
                    self.exhaust();
                }
                Ok(iteration)
            }
            Err(_) => {
                self.exhaust();
                Err(AcquireError::IterationLimitExceeded)
            }
        }
    }

    fn exhaust(&self) {
        if !self.exhausted.is_cancelled() {
            tracing::info!(limit = ?self.limit, "Iteration limit reached.");
        }
        self.exhausted.cancel();
        self.tokens.close();
    }

    /// Token-release loop. Runs once per throttled run.
    ///
    /// Every `tick` it works out how many permits the ramp curve says should
    /// exist by now, and releases the whole-number difference from what has
    /// already been released. Stops at the end of the run, when the iteration
    /// limit is reached, or on cancellation.
    pub async fn release_tokens(&self, clock: RunClock, tick: Duration, cancel: CancellationToken) {
        if !self.is_throttled() {
            return;
        }

        let main_task = async {
            let mut next_tick = clock.start;
            loop {
                let now = Instant::now();
                if now >= clock.end {
                    break;
                }

                let owed = owed_permits(
                    now.saturating_duration_since(clock.start),
                    self.ramp_up,
                    self.throughput,
                );
                let released = self.released();
                let (due, carry) = tokens_due(owed, released, self.release_cap(released));
                if due > 0 {
                    self.add_permits(due);
                }
                tracing::trace!(owed, released, due, carry, "Token release tick.");

                next_tick += tick;
                tokio::time::sleep_until(next_tick).await;
            }
        };

        tokio::select! {
            _ = main_task => {
                tracing::debug!("Token release finished: run duration elapsed.");
            }
            _ = self.exhausted() => {
                tracing::debug!("Token release finished: iteration limit reached.");
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Token release received shutdown signal.");
            }
        };
    }

    fn release_cap(&self, released: u64) -> u64 {
        self.limit
            .map_or(u64::MAX, |limit| limit.saturating_sub(released))
    }

    fn add_permits(&self, due: u64) {
        // Whatever does not fit in the semaphore stays owed for a later tick.
        let headroom = MAX_TOKENS.saturating_sub(self.tokens.available_permits());
        let add = usize::try_from(due).unwrap_or(usize::MAX).min(headroom);
        if add == 0 {
            return;
        }
        self.tokens.add_permits(add);
        let _ = self
            .released
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(add as u64))
            });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::join_all;

    use super::*;

    fn config(throughput: f64, ramp_up: u64, hold: u64, limit: u64) -> RunConfig {
        RunConfig::builder()
            .concurrency(1)
            .throughput(throughput)
            .ramp_up(Duration::from_secs(ramp_up))
            .hold(Duration::from_secs(hold))
            .iteration_limit(limit)
            .build()
    }

    #[tokio::test]
    async fn unthrottled_grants_immediately() {
        let admission = AdmissionController::new(&config(0.0, 0, 1, 0));
        let cancel = CancellationToken::new();

        for expected in 1..=5 {
            assert_eq!(admission.acquire(&cancel).await, Ok(expected));
        }
        assert_eq!(admission.started(), 5);
        assert!(!admission.is_exhausted());
    }

    #[tokio::test]
    async fn unthrottled_refuses_after_cancel() {
        let admission = AdmissionController::new(&config(0.0, 0, 1, 0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(admission.acquire(&cancel).await, Err(AcquireError::Cancelled));
        assert_eq!(admission.started(), 0);
    }

    #[tokio::test]
    async fn limit_is_exact_and_fires_exhausted() {
        let admission = AdmissionController::new(&config(0.0, 0, 1, 3));
        let cancel = CancellationToken::new();

        assert_eq!(admission.acquire(&cancel).await, Ok(1));
        assert_eq!(admission.acquire(&cancel).await, Ok(2));
        assert!(!admission.is_exhausted());
        assert_eq!(admission.acquire(&cancel).await, Ok(3));
        assert!(admission.is_exhausted());
        admission.exhausted().await;

        assert_eq!(
            admission.acquire(&cancel).await,
            Err(AcquireError::IterationLimitExceeded)
        );
        assert_eq!(admission.started(), 3);
    }

    #[tokio::test]
    async fn counter_at_the_top_of_u64_refuses_without_overflow() {
        let admission = AdmissionController::new(&config(0.0, 0, 1, u64::MAX));
        admission.started.store(u64::MAX - 1, Ordering::Release);
        let cancel = CancellationToken::new();

        assert_eq!(admission.acquire(&cancel).await, Ok(u64::MAX));
        assert!(admission.is_exhausted());
        assert_eq!(
            admission.acquire(&cancel).await,
            Err(AcquireError::IterationLimitExceeded)
        );
        assert_eq!(admission.started(), u64::MAX);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn limit_holds_under_contention() {
        let admission = Arc::new(AdmissionController::new(&config(0.0, 0, 1, 100)));
        let cancel = CancellationToken::new();

        let handles = (0..32).map(|_| {
            let admission = admission.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut granted = 0u64;
                while admission.acquire(&cancel).await.is_ok() {
                    granted += 1;
                    tokio::task::yield_now().await;
                }
                granted
            })
        });
        let granted: u64 = join_all(handles)
            .await
            .into_iter()
            .map(|res| res.unwrap())
            .sum();

        assert_eq!(granted, 100);
        assert_eq!(admission.started(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_waiter_is_released_by_cancel() {
        let admission = Arc::new(AdmissionController::new(&config(1.0, 0, 10, 0)));
        let cancel = CancellationToken::new();

        let waiter = {
            let admission = admission.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { admission.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(AcquireError::Cancelled));
        assert_eq!(admission.started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_waiters_are_woken_when_limit_is_reached() {
        let admission = Arc::new(AdmissionController::new(&config(1.0, 0, 10, 1)));
        let cancel = CancellationToken::new();
        admission.add_permits(1);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let admission = admission.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { admission.acquire(&cancel).await })
            })
            .collect();
        let results: Vec<_> = join_all(waiters)
            .await
            .into_iter()
            .map(|res| res.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| **r == Err(AcquireError::IterationLimitExceeded))
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn release_follows_ramp_curve() {
        let config = config(1.0, 2, 3, 0);
        let admission = Arc::new(AdmissionController::new(&config));
        let clock = RunClock::start(&config);
        let cancel = CancellationToken::new();

        let release = {
            let admission = admission.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                admission
                    .release_tokens(clock, Duration::from_millis(100), cancel)
                    .await
            })
        };

        for (at_ms, expected) in [(950, 0), (2_050, 1), (3_050, 2), (4_050, 3)] {
            tokio::time::sleep_until(clock.start + Duration::from_millis(at_ms)).await;
            assert_eq!(admission.released(), expected, "at {at_ms}ms");
            let ceiling = owed_permits(clock.elapsed(), config.ramp_up, config.throughput);
            assert!(admission.released() as f64 <= ceiling);
        }

        release.await.unwrap();
        assert!(Instant::now() >= clock.end);
        assert_eq!(admission.released(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn release_never_exceeds_iteration_limit() {
        let config = config(100.0, 0, 5, 7);
        let admission = Arc::new(AdmissionController::new(&config));
        let clock = RunClock::start(&config);

        admission
            .release_tokens(clock, Duration::from_millis(100), CancellationToken::new())
            .await;

        assert_eq!(admission.released(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn release_stops_on_cancel() {
        let config = config(10.0, 0, 60, 0);
        let admission = Arc::new(AdmissionController::new(&config));
        let clock = RunClock::start(&config);
        let cancel = CancellationToken::new();

        let release = {
            let admission = admission.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                admission
                    .release_tokens(clock, Duration::from_millis(100), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        cancel.cancel();
        release.await.unwrap();

        let released = admission.released();
        assert_eq!(released, 10);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(admission.released(), released);
    }

    #[tokio::test]
    async fn unthrottled_release_is_a_no_op() {
        let config = config(0.0, 0, 60, 0);
        let admission = AdmissionController::new(&config);
        admission
            .release_tokens(
                RunClock::start(&config),
                Duration::from_millis(100),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(admission.released(), 0);
    }
}
