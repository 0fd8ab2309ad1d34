//! Worker pool. Brings workers up over the ramp-up window and runs them.
//!
//! One ramp task owns the number of workers still to spawn and the join
//! handles of the ones already running. It starts one worker, sleeps for
//! `ramp_up / concurrency`, and repeats. As soon as the ramp window is over it
//! starts whatever is left in one go. Cancellation stops it from spawning
//! anything further.
//!
//! Every worker runs the same loop: wait for a permit, execute one unit of
//! work, push the sample to the result sink, repeat. Workers never talk to each
//! other; they only meet at the [`AdmissionController`] and the shared
//! cancellation token.

use serde::{Serialize, Serializer};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    admission::{AcquireError, AdmissionController},
    config::{RunClock, RunConfig},
    sink::Sample,
    summary::Tally,
    workload::Workload,
};

/// Identity of a worker. Used for attribution only; workers behave the same.
///
/// Displays and serializes as `worker_<n>`, counting from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker_{}", self.0)
    }
}

impl Serialize for WorkerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Everything a worker needs, shared by all workers of a run.
pub struct WorkerContext<W: Workload> {
    pub workload: Arc<W>,
    pub admission: Arc<AdmissionController>,
    pub results: mpsc::Sender<Sample<W::Outcome>>,
    pub cancel: CancellationToken,
    pub scenario: Arc<str>,
}

impl<W: Workload> Clone for WorkerContext<W> {
    fn clone(&self) -> Self {
        Self {
            workload: self.workload.clone(),
            admission: self.admission.clone(),
            results: self.results.clone(),
            cancel: self.cancel.clone(),
            scenario: self.scenario.clone(),
        }
    }
}

/// Progressive worker spawner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    concurrency: usize,
    ramp_up: Duration,
}

impl WorkerPool {
    pub fn new(concurrency: usize, ramp_up: Duration) -> Self {
        Self {
            concurrency,
            ramp_up,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.concurrency, config.ramp_up)
    }

    /// Delay between two consecutive spawns, or `None` when every worker
    /// starts at once.
    pub fn step_interval(&self) -> Option<Duration> {
        if self.concurrency <= 1 || self.ramp_up <= Duration::from_secs(1) {
            return None;
        }
        let divisor = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        Some((self.ramp_up / divisor).min(self.ramp_up))
    }

    /// Spawn workers over the ramp window.
    ///
    /// Resolves once every worker has been spawned, or early on cancellation,
    /// with the join handles of the workers that were started. Each handle
    /// yields that worker's [`Tally`].
    pub async fn ramp<W: Workload>(
        self,
        clock: RunClock,
        ctx: WorkerContext<W>,
    ) -> Vec<JoinHandle<Tally>> {
        let mut handles = Vec::with_capacity(self.concurrency);
        let mut remaining = self.concurrency;

        if let Some(step) = self.step_interval() {
            tracing::info!(
                "Ramping up {} workers, one every {:?}...",
                self.concurrency,
                step
            );
            while remaining > 0 && clock.elapsed() < self.ramp_up {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                handles.push(spawn_worker(WorkerId::new(handles.len() + 1), ctx.clone()));
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(step) => {}
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            tracing::debug!(
                spawned = handles.len(),
                remaining,
                "Ramp-up cancelled, not spawning remaining workers."
            );
            return handles;
        }

        if remaining > 0 {
            tracing::info!("Spawning {remaining} workers...");
        }
        for _ in 0..remaining {
            handles.push(spawn_worker(WorkerId::new(handles.len() + 1), ctx.clone()));
        }
        handles
    }
}

fn spawn_worker<W: Workload>(id: WorkerId, ctx: WorkerContext<W>) -> JoinHandle<Tally> {
    tokio::spawn(worker_loop(id, ctx))
}

async fn worker_loop<W: Workload>(id: WorkerId, ctx: WorkerContext<W>) -> Tally {
    let mut tally = Tally::default();
    tracing::debug!("Worker {id} started.");

    while !ctx.cancel.is_cancelled() {
        let iteration = match ctx.admission.acquire(&ctx.cancel).await {
            Ok(iteration) => iteration,
            Err(AcquireError::Cancelled) => break,
            Err(AcquireError::IterationLimitExceeded) => {
                tracing::debug!("Worker {id} stopping: iteration limit reached.");
                break;
            }
        };

        let started_at = SystemTime::now();
        let start = Instant::now();
        let result = ctx.workload.execute(id).await;
        let sample = Sample {
            worker: id,
            iteration,
            scenario: ctx.scenario.clone(),
            started_at,
            elapsed: start.elapsed(),
            result,
        };
        tally.consume(&sample);

        if ctx.results.send(sample).await.is_err() {
            tracing::warn!("Worker {id} stopping: result sink is gone.");
            break;
        }
    }

    tracing::debug!("Worker {id} shutting down.");
    tally
}
