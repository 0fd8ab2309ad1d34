//! Run orchestration: one load test from start to summary.
//!
//! A run goes through four phases:
//!
//! 1. **Starting**: the configuration and the workload are validated, the run
//!    clock is fixed and the background tasks are spawned: the result sink,
//!    the token-release loop (when throttled) and the worker ramp.
//! 2. **Running**: the orchestrator waits for the first of the duration
//!    elapsing, the iteration limit being reached, or the caller cancelling.
//! 3. **Draining**: the run token is cancelled. Workers finish whatever they
//!    are executing and exit, the result queue closes and the sink flushes.
//!    Both waits are bounded by grace periods.
//! 4. **Idle**: the summary is returned and another run may start.
//!
//! Runs on the same [`Orchestrator`] never overlap. [`Orchestrator::run`]
//! waits for the previous run to finish, [`Orchestrator::try_run`] refuses
//! with [`RunError::AlreadyRunning`].

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    admission::AdmissionController,
    config::{RunClock, RunConfig},
    error::RunError,
    pool::{WorkerContext, WorkerPool},
    sink::{sink_task, SampleWriter},
    summary::{RunSummary, Tally, Termination},
    workload::Workload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Starting,
    Running,
    Draining,
}

/// Drives runs of one workload, writing every sample to one writer.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use surge::{CommandWorkload, LdjsonWriter, Orchestrator, RunConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let workload = CommandWorkload::builder().program("true").build();
/// let writer = LdjsonWriter::create("report.ldjson").await?;
/// let orchestrator = Orchestrator::new(workload, writer);
///
/// let config = RunConfig::builder()
///     .concurrency(8)
///     .throughput(50.0)
///     .ramp_up(Duration::from_secs(10))
///     .hold(Duration::from_secs(60))
///     .build();
/// let summary = orchestrator.run(config, CancellationToken::new()).await?;
/// println!("{} executions", summary.tally.executions);
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator<W, S> {
    workload: Arc<W>,
    writer: Arc<Mutex<S>>,
    gate: Mutex<()>,
    phase: watch::Sender<RunPhase>,
}

impl<W, S> Orchestrator<W, S>
where
    W: Workload,
    S: SampleWriter<W::Outcome>,
{
    pub fn new(workload: W, writer: S) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            workload: Arc::new(workload),
            writer: Arc::new(Mutex::new(writer)),
            gate: Mutex::new(()),
            phase,
        }
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    /// Subscribe to phase changes.
    pub fn phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Run once, waiting for any run already in progress to finish first.
    ///
    /// Cancelling `cancel` ends the run early; that is not an error and is
    /// reported as [`Termination::Cancelled`].
    pub async fn run(
        &self,
        config: RunConfig,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let _gate = self.gate.lock().await;
        self.run_exclusive(config, cancel).await
    }

    /// Like [`run`](Self::run), but fails with [`RunError::AlreadyRunning`]
    /// instead of waiting.
    pub async fn try_run(
        &self,
        config: RunConfig,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let _gate = self
            .gate
            .try_lock()
            .map_err(|_| RunError::AlreadyRunning)?;
        self.run_exclusive(config, cancel).await
    }

    async fn run_exclusive(
        &self,
        config: RunConfig,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let _idle = PhaseReset(&self.phase);
        self.phase.send_replace(RunPhase::Starting);

        config.validate()?;
        self.workload.prepare().await.map_err(RunError::Workload)?;

        // Cancelled on every way out, including this future being dropped.
        let run_cancel = cancel.child_token();
        let _stop = run_cancel.clone().drop_guard();

        let clock = RunClock::start(&config);
        let admission = Arc::new(AdmissionController::new(&config));
        let (results, results_rx) = mpsc::channel(config.result_buffer);

        tracing::info!("Spawning result sink task...");
        let sink = tokio::spawn(sink_task(
            self.writer.clone(),
            results_rx,
            config.result_buffer,
        ));

        let release = admission.is_throttled().then(|| {
            tracing::info!("Spawning token release task...");
            let admission = admission.clone();
            let cancel = run_cancel.clone();
            let tick = config.tick;
            tokio::spawn(async move { admission.release_tokens(clock, tick, cancel).await })
        });

        let ctx = WorkerContext {
            workload: self.workload.clone(),
            admission: admission.clone(),
            results,
            cancel: run_cancel.clone(),
            scenario: Arc::from(self.workload.name()),
        };
        let ramp = tokio::spawn(WorkerPool::from_config(&config).ramp(clock, ctx));

        self.phase.send_replace(RunPhase::Running);
        tracing::info!(
            scenario = self.workload.name(),
            concurrency = config.concurrency,
            throughput = config.throughput,
            "Running now!"
        );

        let termination = tokio::select! {
            biased;
            _ = cancel.cancelled() => Termination::Cancelled,
            _ = admission.exhausted() => Termination::IterationLimit,
            _ = tokio::time::sleep_until(clock.end) => Termination::Duration,
        };
        tracing::info!(?termination, "Run is over, draining...");
        run_cancel.cancel();
        self.phase.send_replace(RunPhase::Draining);

        if let Some(release) = release {
            if let Err(e) = release.await {
                tracing::error!("Token release task failed: {e}");
            }
        }
        let handles = match ramp.await {
            Ok(handles) => handles,
            Err(e) => {
                tracing::error!("Worker ramp task failed: {e}");
                Vec::new()
            }
        };
        let workers = handles.len();

        tracing::info!("Retrieving data from {workers} workers...");
        let tally = join_workers(handles, config.join_timeout).await;
        let samples_written = drain_sink(sink, config.drain_timeout).await;

        let summary = RunSummary {
            tally,
            workers,
            wall_time: clock.elapsed(),
            termination,
            samples_written,
        };
        tracing::info!(
            executions = summary.tally.executions,
            passed = summary.tally.passed,
            failed = summary.tally.failed,
            broken = summary.tally.broken,
            "Done running scenario: {}!",
            self.workload.name()
        );
        Ok(summary)
    }
}

struct PhaseReset<'a>(&'a watch::Sender<RunPhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.send_replace(RunPhase::Idle);
    }
}

/// Merge the tallies of every worker that finishes within `grace`. The rest
/// are aborted and their counts lost.
async fn join_workers(handles: Vec<JoinHandle<Tally>>, grace: Duration) -> Tally {
    let deadline = Instant::now() + grace;
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    let results = join_all(
        handles
            .into_iter()
            .map(|handle| tokio::time::timeout_at(deadline, handle)),
    )
    .await;

    let mut tally = Tally::default();
    let mut stragglers = 0usize;
    for (result, abort) in results.into_iter().zip(aborts) {
        match result {
            Ok(Ok(worker)) => tally.merge(worker),
            Ok(Err(e)) => tracing::error!("Worker task failed: {e}"),
            Err(_) => {
                abort.abort();
                stragglers += 1;
            }
        }
    }
    if stragglers > 0 {
        tracing::warn!(
            stragglers,
            "Workers still busy after {grace:?}, aborting them."
        );
    }
    tally
}

async fn drain_sink(sink: JoinHandle<u64>, grace: Duration) -> Option<u64> {
    let abort = sink.abort_handle();
    match tokio::time::timeout(grace, sink).await {
        Ok(Ok(written)) => Some(written),
        Ok(Err(e)) => {
            tracing::error!("Result sink task failed: {e}");
            None
        }
        Err(_) => {
            abort.abort();
            tracing::warn!("Result sink did not drain within {grace:?}, abandoning it.");
            None
        }
    }
}
