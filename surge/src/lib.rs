//! Surge, a load-generation scheduler for Rust.
//!
//! Surge repeatedly executes a unit of work (a [`Workload`]) from a pool of
//! concurrent workers, for a bounded duration or number of iterations, while
//! holding a target throughput that ramps up linearly from zero.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Orchestrator`]: owns the lifecycle of a run. It starts everything, waits
//!   for the run to end (duration, iteration limit or cancellation) and shuts
//!   everything down in order.
//! - [`AdmissionController`]: decides when a worker may execute next. It
//!   releases permits along the throughput curve and enforces the iteration
//!   limit with a single atomic counter.
//! - [`WorkerPool`]: brings workers up progressively over the ramp-up window.
//!   Each worker loops: acquire a permit, execute, hand the [`Sample`] over.
//! - [`SampleWriter`]: where samples end up. A single sink task drains the
//!   result queue into it. [`LdjsonWriter`] writes one JSON object per line,
//!   [`MemoryWriter`] keeps everything in memory.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use surge::{MemoryWriter, Orchestrator, RunConfig, Scenario, WorkerId, WorkloadError};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let scenario = Scenario::builder()
//!         .name("sleepy")
//!         .action(|_: WorkerId| async {
//!             tokio::time::sleep(Duration::from_millis(5)).await;
//!             Ok::<_, WorkloadError>(())
//!         })
//!         .build();
//!     let writer = MemoryWriter::new();
//!     let orchestrator = Orchestrator::new(scenario, writer.clone());
//!
//!     let config = RunConfig::builder()
//!         .concurrency(4)
//!         .throughput(100.0)
//!         .ramp_up(Duration::from_millis(200))
//!         .hold(Duration::from_millis(300))
//!         .build();
//!     let summary = orchestrator
//!         .run(config, CancellationToken::new())
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(summary.tally.executions as usize, writer.len());
//! }
//! ```
//!
//! # Feature flags
//!
//! - `macros`: the `#[outcome]` attribute, which derives everything an
//!   [`Outcome`] needs. (Enabled by default)
//! - `internals`: exposes the throughput curve helpers used by the admission
//!   controller, for benchmarking and testing.

/// Permit issuing and iteration accounting
pub mod admission;
/// Run configuration and clock
pub mod config;
pub mod error;
/// Run lifecycle
pub mod orchestrator;
/// Worker spawning and the worker loop
pub mod pool;
/// Result queue and writers
pub mod sink;
pub mod summary;
/// Units of work
pub mod workload;

pub use admission::{AcquireError, AdmissionController};
pub use config::{ConfigError, RunClock, RunConfig};
pub use error::{RunError, SinkError, WorkloadError};
pub use orchestrator::{Orchestrator, RunPhase};
pub use pool::{WorkerContext, WorkerId, WorkerPool};
pub use sink::{LdjsonWriter, MemoryWriter, Sample, SampleWriter};
pub use summary::{RunSummary, Tally, Termination};
pub use workload::{CommandOutcome, CommandWorkload, Outcome, Scenario, Status, Workload};

#[cfg(feature = "macros")]
/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use surge_macros::*;
}
