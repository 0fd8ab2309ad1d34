use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by [`Orchestrator::run`](crate::Orchestrator::run).
///
/// Only problems detected before any worker starts end up here. Cancellation,
/// duration expiry and iteration exhaustion are normal ways for a run to end
/// and are reported through [`RunSummary::termination`](crate::RunSummary)
/// instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid run configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("workload failed validation: {0}")]
    Workload(#[source] WorkloadError),
    #[error("another run is already in progress")]
    AlreadyRunning,
    #[error("result sink could not be opened: {0}")]
    Sink(#[from] SinkError),
}

/// An opaque failure produced by a [`Workload`](crate::Workload).
///
/// The scheduler never interprets it; it is forwarded to the sink and recorded
/// as a broken sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadError {
    pub message: String,
    pub trace: Option<String>,
}

impl WorkloadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Validation failure used when a workload resolves to no work at all.
    pub fn nothing_to_execute(detail: impl fmt::Display) -> Self {
        Self::new(format!("nothing to execute: {detail}"))
    }
}

impl fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WorkloadError {}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize sample: {0}")]
    Serialize(#[from] serde_json::Error),
}
