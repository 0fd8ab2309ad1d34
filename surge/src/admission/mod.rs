//! Admission control: deciding when a worker may execute its next unit of work.
//!
//! The [`AdmissionController`] issues execution permits ("tokens") following a
//! throughput curve and independently enforces the run's iteration limit.
//! It owns no worker state: workers simply call [`AdmissionController::acquire`]
//! before every execution.
//!
//! This design separates **rate generation** (the token-release loop) from
//! **work execution** (the workers) and keeps the hot path in workers down to a
//! semaphore wait and a compare-and-swap.
//!
//! # High-level flow
//! 1. The orchestrator creates one controller per run.
//! 2. If the run is throttled, the orchestrator spawns
//!    [`AdmissionController::release_tokens`]. Every `tick` it adds permits to
//!    an initially empty [`tokio::sync::Semaphore`].
//! 3. Each worker waits for a permit, forgets it, then claims an iteration number
//!    from the shared counter. Claiming fails once the iteration limit is reached.
//! 4. Reaching the limit closes the semaphore, waking every waiter, and resolves
//!    [`AdmissionController::exhausted`] so the orchestrator can end the run early.
//!
//! # Mathematical behavior of the release loop
//! The instantaneous rate rises linearly from zero to `throughput` over
//! `ramp_up` and then holds. The number of permits owed after `t` seconds is
//! its integral:
//!
//! ```text
//! t <= ramp:  owed(t) = throughput * t² / (2 * ramp)
//! t >  ramp:  owed(t) = throughput * ramp / 2 + throughput * (t - ramp)
//! ```
//!
//! On each tick the loop releases `floor(owed(t) - released)` permits. The
//! fractional part is never thrown away; it stays owed and is released by a later
//! tick once it adds up to a whole permit.
//!
//! # Tuning knobs
//! - `tick` (Duration): granularity of releases. Smaller ticks smooth the rate
//!   at the cost of more wakeups. The default is 100ms.

mod controller;
mod curve;

pub use controller::{AcquireError, AdmissionController};

#[cfg(feature = "internals")]
pub use curve::{owed_permits, tokens_due, MAX_TOKENS};
#[cfg(all(test, not(feature = "internals")))]
pub(crate) use curve::owed_permits;
