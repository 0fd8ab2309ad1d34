use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use surge::{CommandWorkload, LdjsonWriter, Orchestrator, RunConfig, RunError};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Run a program repeatedly under a ramped, throttled load.
#[derive(Debug, Parser)]
#[command(name = "surge", version, about)]
#[command(after_help = "Example: surge -c 4 -t 20 -r 10 -d 60 -- curl -sf http://localhost:8080")]
struct Cli {
    /// Number of concurrent workers
    #[arg(short, long, env = "SURGE_CONCURRENCY", default_value_t = 1, allow_negative_numbers = true)]
    concurrency: i64,

    /// Target executions per second, 0 for unthrottled
    #[arg(short, long, env = "SURGE_THROUGHPUT", default_value_t = 0.0)]
    throughput: f64,

    /// Seconds taken to reach full concurrency and throughput
    #[arg(short, long = "ramp-up", env = "SURGE_RAMP_UP", default_value_t = 0.0, allow_negative_numbers = true)]
    ramp_up: f64,

    /// Seconds to hold full load after ramp-up
    #[arg(short = 'd', long = "hold-for", env = "SURGE_HOLD_FOR", default_value_t = 0.0, allow_negative_numbers = true)]
    hold_for: f64,

    /// Maximum number of executions, 0 for unlimited
    #[arg(short, long, env = "SURGE_ITERATIONS", default_value_t = 0)]
    iterations: u64,

    /// Where to write one JSON line per execution
    #[arg(short = 'f', long, env = "SURGE_REPORT_FILE", default_value = "report.ldjson")]
    report_file: PathBuf,

    /// Value of the `test_suite` field in the report
    #[arg(long, env = "SURGE_SUITE", default_value = "surge")]
    suite: String,

    /// Period of the token release loop, in milliseconds
    #[arg(long, env = "SURGE_TICK_MS", default_value_t = 100)]
    tick_ms: u64,

    /// Seconds to wait for the report to be flushed once the run ends
    #[arg(long, env = "SURGE_DRAIN_TIMEOUT", default_value_t = 30.0)]
    drain_timeout: f64,

    /// Program to run, followed by its arguments
    #[arg(last = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

impl Cli {
    fn run_config(&self) -> anyhow::Result<RunConfig> {
        let concurrency = usize::try_from(self.concurrency.max(1)).unwrap_or(usize::MAX);
        let ramp_up = seconds("ramp-up", self.ramp_up)?;
        let hold = seconds("hold-for", self.hold_for)?;

        // Nothing bounds the run: make a single pass.
        let iterations = if ramp_up.is_zero() && hold.is_zero() && self.iterations == 0 {
            1
        } else {
            self.iterations
        };

        Ok(RunConfig::builder()
            .concurrency(concurrency)
            .throughput(self.throughput)
            .ramp_up(ramp_up)
            .hold(hold)
            .iteration_limit(iterations)
            .tick(Duration::from_millis(self.tick_ms))
            .drain_timeout(seconds("drain-timeout", self.drain_timeout)?)
            .build())
    }

    fn workload(&self) -> anyhow::Result<CommandWorkload> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("no program was given");
        };
        Ok(CommandWorkload::builder()
            .program(program.as_str())
            .args(args.to_vec())
            .build())
    }
}

fn seconds(name: &str, value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("--{name} must be a non-negative number of seconds, got {value}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.run_config()?;
    config.validate()?;
    let workload = cli.workload()?;

    tracing::info!(
        concurrency = config.concurrency,
        throughput = config.throughput,
        ramp_up = ?config.ramp_up,
        hold = ?config.hold,
        iterations = config.iteration_limit,
        report = %cli.report_file.display(),
        "Effective configuration"
    );

    let writer = LdjsonWriter::create(&cli.report_file)
        .await
        .map_err(RunError::from)
        .with_context(|| format!("cannot open {}", cli.report_file.display()))?
        .with_suite(cli.suite.as_str());
    let orchestrator = Orchestrator::new(workload, writer);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping the run...");
                cancel.cancel();
            }
        });
    }

    let summary = orchestrator.run(config, cancel).await?;
    tracing::info!(
        termination = ?summary.termination,
        executions = summary.tally.executions,
        passed = summary.tally.passed,
        failed = summary.tally.failed,
        broken = summary.tally.broken,
        workers = summary.workers,
        wall_time = ?summary.wall_time,
        throughput = %format!("{:.2}/s", summary.achieved_throughput()),
        average_latency = ?summary.tally.average_latency(),
        "Run summary"
    );
    match summary.samples_written {
        Some(written) => tracing::info!("Wrote {written} samples to {}", cli.report_file.display()),
        None => tracing::warn!("Report {} may be incomplete", cli.report_file.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("surge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_map_onto_the_config() {
        let cli = parse(&[
            "-c", "4", "-t", "20", "-r", "10", "-d", "60", "-i", "500", "--", "curl", "-sf",
            "http://localhost",
        ]);
        let config = cli.run_config().unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.throughput, 20.0);
        assert_eq!(config.ramp_up, Duration::from_secs(10));
        assert_eq!(config.hold, Duration::from_secs(60));
        assert_eq!(config.iteration_limit, 500);
        assert_eq!(cli.report_file, PathBuf::from("report.ldjson"));

        let workload = cli.workload().unwrap();
        assert_eq!(workload.program, "curl");
        assert_eq!(workload.args, vec!["-sf", "http://localhost"]);
    }

    #[test]
    fn non_positive_concurrency_becomes_one() {
        let config = parse(&["-c", "-3", "-d", "1", "--", "true"]).run_config().unwrap();
        assert_eq!(config.concurrency, 1);
        let config = parse(&["-c", "0", "-d", "1", "--", "true"]).run_config().unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn unbounded_run_becomes_a_single_pass() {
        let config = parse(&["--", "true"]).run_config().unwrap();
        assert_eq!(config.iteration_limit, 1);

        let config = parse(&["-d", "5", "--", "true"]).run_config().unwrap();
        assert_eq!(config.iteration_limit, 0);
    }

    #[test]
    fn negative_durations_are_rejected() {
        assert!(parse(&["-r", "-1", "--", "true"]).run_config().is_err());
    }

    #[test]
    fn a_program_is_required() {
        assert!(Cli::try_parse_from(["surge", "-c", "2"]).is_err());
    }
}
