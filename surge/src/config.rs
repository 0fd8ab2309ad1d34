use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

/// Load profile for a single run.
///
/// ```rust
/// use std::time::Duration;
/// use surge::RunConfig;
///
/// let config = RunConfig::builder()
///     .concurrency(4)
///     .throughput(20.0)
///     .ramp_up(Duration::from_secs(10))
///     .hold(Duration::from_secs(60))
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct RunConfig {
    /// Number of workers alive once ramp-up completes.
    pub concurrency: usize,
    /// Target executions per second. `0.0` means unthrottled.
    #[builder(default = 0.0)]
    #[serde(default)]
    pub throughput: f64,
    /// Time taken to reach full concurrency and throughput.
    #[builder(default = Duration::ZERO)]
    #[serde(default)]
    pub ramp_up: Duration,
    /// Steady-state time after ramp-up.
    #[builder(default = Duration::ZERO)]
    #[serde(default)]
    pub hold: Duration,
    /// Maximum executions across all workers. `0` means unlimited.
    #[builder(default = 0)]
    #[serde(default)]
    pub iteration_limit: u64,
    /// Period of the token-release loop.
    #[builder(default = default_tick())]
    #[serde(default = "default_tick")]
    pub tick: Duration,
    /// Grace period for the result sink to flush after the run ends.
    #[builder(default = default_drain_timeout())]
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: Duration,
    /// Grace period for in-flight executions after the run is cancelled.
    #[builder(default = default_join_timeout())]
    #[serde(default = "default_join_timeout")]
    pub join_timeout: Duration,
    /// Capacity of the queue between workers and the result sink.
    #[builder(default = default_result_buffer())]
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_result_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("throughput must be a finite, non-negative number (got {0})")]
    InvalidThroughput(f64),
    #[error("tick must be greater than zero")]
    ZeroTick,
    #[error("result buffer must hold at least one sample")]
    ZeroResultBuffer,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if !self.throughput.is_finite() || self.throughput < 0.0 {
            return Err(ConfigError::InvalidThroughput(self.throughput));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.result_buffer == 0 {
            return Err(ConfigError::ZeroResultBuffer);
        }
        Ok(())
    }

    /// Whether the admission controller releases permits over time.
    pub fn is_throttled(&self) -> bool {
        self.throughput > 0.0
    }

    pub fn iteration_limit(&self) -> Option<u64> {
        (self.iteration_limit > 0).then_some(self.iteration_limit)
    }

    /// Ramp-up plus hold.
    pub fn duration(&self) -> Duration {
        self.ramp_up.saturating_add(self.hold)
    }

    /// How long the run may last. A zero-length window with an iteration
    /// limit is bounded by the limit alone.
    pub fn time_bound(&self) -> Option<Duration> {
        let duration = self.duration();
        if duration.is_zero() && self.iteration_limit().is_some() {
            None
        } else {
            Some(duration)
        }
    }
}

/// Start and end instants of a run. Fixed once the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunClock {
    pub start: Instant,
    pub end: Instant,
}

impl RunClock {
    pub fn start(config: &RunConfig) -> Self {
        Self::starting_at(Instant::now(), config)
    }

    pub fn starting_at(start: Instant, config: &RunConfig) -> Self {
        // An end instant too far out to represent is as good as never.
        let end = config
            .time_bound()
            .and_then(|bound| start.checked_add(bound))
            .unwrap_or_else(|| far_future(start));
        Self { start, end }
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.start)
    }

    pub fn is_over(&self) -> bool {
        Instant::now() >= self.end
    }
}

fn far_future(start: Instant) -> Instant {
    // Roughly thirty years, which is what tokio itself uses for "never".
    start + Duration::from_secs(86400 * 365 * 30)
}
