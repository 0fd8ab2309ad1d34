use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    sink::Sample,
    workload::{Outcome, Status},
};

/// Counts kept by every worker and merged at the end of a run.
///
/// `merge` is associative and commutative; worker tallies are merged in
/// whatever order the workers are joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub executions: u64,
    pub passed: u64,
    pub failed: u64,
    pub broken: u64,
    /// Sum of the time spent inside the workload.
    pub busy_time: Duration,
}

impl Tally {
    pub fn consume<O: Outcome>(&mut self, sample: &Sample<O>) {
        self.executions += 1;
        match sample.status() {
            Status::Passed => self.passed += 1,
            Status::Failed => self.failed += 1,
            Status::Broken => self.broken += 1,
        }
        self.busy_time = self.busy_time.saturating_add(sample.elapsed);
    }

    pub fn merge(&mut self, other: Self) {
        self.executions += other.executions;
        self.passed += other.passed;
        self.failed += other.failed;
        self.broken += other.broken;
        self.busy_time = self.busy_time.saturating_add(other.busy_time);
    }

    /// Share of executions that passed, in percent.
    pub fn success_ratio(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.passed as f64 / self.executions as f64 * 100.0
    }

    pub fn average_latency(&self) -> Duration {
        if self.executions == 0 {
            return Duration::ZERO;
        }
        self.busy_time.div_f64(self.executions as f64)
    }
}

/// How a run came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Ramp-up plus hold elapsed.
    Duration,
    /// The iteration limit was reached.
    IterationLimit,
    /// The caller cancelled the run.
    Cancelled,
}

/// What [`Orchestrator::run`](crate::Orchestrator::run) returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tally: Tally,
    pub workers: usize,
    pub wall_time: Duration,
    pub termination: Termination,
    /// Samples persisted by the sink. `None` when the sink missed its drain
    /// deadline and was abandoned.
    pub samples_written: Option<u64>,
}

impl RunSummary {
    /// Executions per second over the whole run.
    pub fn achieved_throughput(&self) -> f64 {
        let secs = self.wall_time.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.tally.executions as f64 / secs
    }
}
