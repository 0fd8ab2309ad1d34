//! Workloads: the unit of work being driven under load.
//!
//! The scheduler treats a workload as a black box: it asks it once whether
//! there is anything to run ([`Workload::prepare`]) and then calls
//! [`Workload::execute`] concurrently from every worker. Whatever comes back,
//! success or failure, is forwarded untouched to the result sink.

mod command;

pub use command::{CommandOutcome, CommandWorkload};

use serde::{Deserialize, Serialize};
use std::{fmt::Debug, future::Future, marker::PhantomData};
use typed_builder::TypedBuilder;

use crate::{error::WorkloadError, pool::WorkerId};

/// Final status of one execution, as written to reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Passed,
    Failed,
    /// The workload could not run at all.
    Broken,
}

/// The value produced by one successful call to [`Workload::execute`].
///
/// An outcome may still describe a failure of the system under test (a failed
/// assertion, a non-zero exit code); it reports that through [`status`](Self::status).
/// It only has to be serializable, so any report format can embed it.
///
/// ## Example
/// ```rust
/// use serde::Serialize;
/// use surge::{Outcome, Status};
///
/// #[derive(Debug, Serialize)]
/// struct HttpOutcome {
///     code: u16,
/// }
///
/// impl Outcome for HttpOutcome {
///     fn status(&self) -> Status {
///         if self.code < 400 { Status::Passed } else { Status::Failed }
///     }
/// }
/// ```
pub trait Outcome
where
    Self: Serialize + Send + Sync + Debug + 'static,
{
    fn status(&self) -> Status {
        Status::Passed
    }

    /// Short human-readable reason when [`status`](Self::status) is not `Passed`.
    fn error_message(&self) -> Option<String> {
        None
    }

    /// Extra diagnostic detail, e.g. captured output.
    fn error_trace(&self) -> Option<&str> {
        None
    }
}

impl Outcome for () {}
impl Outcome for bool {}
impl Outcome for u32 {}
impl Outcome for u64 {}
impl Outcome for usize {}
impl Outcome for String {}

/// A unit of work that workers execute repeatedly.
///
/// Implementations must be safe to call from many workers at once. Retrying a
/// failed execution is up to the implementation; workers never retry.
pub trait Workload: Send + Sync + 'static {
    type Outcome: Outcome;

    fn name(&self) -> &str;

    /// Check that there is something to execute.
    ///
    /// Called once per run before any worker starts. An error here aborts the run.
    fn prepare(&self) -> impl Future<Output = Result<(), WorkloadError>> + Send {
        async { Ok(()) }
    }

    /// Execute one unit of work on behalf of `worker`.
    fn execute(
        &self,
        worker: WorkerId,
    ) -> impl Future<Output = Result<Self::Outcome, WorkloadError>> + Send;
}

/// A workload backed by an async closure.
///
/// NEVER instantiate heavy objects like clients inside the action. Build them
/// once, move them into the closure and clone the handle per call.
///
/// ```rust
/// use surge::{Scenario, WorkerId, WorkloadError};
///
/// let scenario = Scenario::builder()
///     .name("noop")
///     .action(|_worker: WorkerId| async { Ok::<_, WorkloadError>(()) })
///     .build();
/// assert_eq!(scenario.name, "noop");
/// ```
#[derive(Clone, TypedBuilder)]
pub struct Scenario<O, F, Fut>
where
    O: Outcome,
    F: Fn(WorkerId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, WorkloadError>> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    #[builder(default, setter(skip))]
    outcome: PhantomData<fn() -> (O, Fut)>,
}

impl<O, F, Fut> Workload for Scenario<O, F, Fut>
where
    O: Outcome,
    F: Fn(WorkerId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, WorkloadError>> + Send + 'static,
{
    type Outcome = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, worker: WorkerId) -> impl Future<Output = Result<O, WorkloadError>> + Send {
        (self.action)(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "macros")]
    mod derived {
        use super::*;
        use crate::macros::outcome;

        #[outcome]
        struct Checkout {
            items: u32,
        }

        #[tokio::test]
        async fn outcome_attribute_makes_a_usable_outcome() {
            let scenario = Scenario::builder()
                .name("checkout")
                .action(|_: WorkerId| async { Ok(Checkout { items: 3 }) })
                .build();

            let outcome = scenario.execute(WorkerId::new(1)).await.unwrap();
            assert_eq!(outcome, Checkout { items: 3 });
            assert_eq!(outcome.clone().status(), Status::Passed);
            assert_eq!(serde_json::to_string(&outcome).unwrap(), r#"{"items":3}"#);
        }
    }

    #[tokio::test]
    async fn scenario_forwards_worker_and_result() {
        let scenario = Scenario::builder()
            .name("echo")
            .action(|worker: WorkerId| async move {
                if worker.index() % 2 == 0 {
                    Ok(worker.index())
                } else {
                    Err(WorkloadError::new("odd worker"))
                }
            })
            .build();

        assert_eq!(scenario.name(), "echo");
        assert!(scenario.prepare().await.is_ok());
        assert_eq!(scenario.execute(WorkerId::new(2)).await, Ok(2));
        assert_eq!(
            scenario.execute(WorkerId::new(3)).await,
            Err(WorkloadError::new("odd worker"))
        );
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Status::Passed).unwrap(), r#""PASSED""#);
        assert_eq!(serde_json::to_string(&Status::Broken).unwrap(), r#""BROKEN""#);
    }
}
