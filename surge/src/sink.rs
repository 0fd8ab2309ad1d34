//! Result sink, where samples go once a worker has produced them.
//!
//! Workers push [`Sample`]s into a bounded queue. A single sink task drains the
//! queue and hands each sample to a [`SampleWriter`]. Closing the queue (every
//! sender dropped) is the "run complete" signal: the task writes whatever is
//! still queued, flushes the writer and exits. The orchestrator waits for that
//! within a grace period and abandons the task if it takes longer.

use serde::Serialize;
use std::{
    fmt::Debug,
    future::Future,
    path::Path,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, Mutex},
};

use crate::{
    error::{SinkError, WorkloadError},
    pool::WorkerId,
    workload::{Outcome, Status},
};

/// One execution, as recorded by the worker that ran it.
#[derive(Debug, Clone)]
pub struct Sample<O> {
    pub worker: WorkerId,
    /// 1-based position of this execution across the whole run.
    pub iteration: u64,
    pub scenario: Arc<str>,
    pub started_at: SystemTime,
    pub elapsed: Duration,
    pub result: Result<O, WorkloadError>,
}

impl<O: Outcome> Sample<O> {
    pub fn status(&self) -> Status {
        match &self.result {
            Ok(outcome) => outcome.status(),
            Err(_) => Status::Broken,
        }
    }
}

/// Persists samples somewhere: a file, a database, memory.
///
/// A writer is driven by a single task, so it does not need to be `Sync`.
/// Errors are logged and counted by the sink task; they never stop a run.
pub trait SampleWriter<O: Outcome>: Send + 'static {
    fn write(&mut self, sample: &Sample<O>) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Called once after the last sample has been written.
    fn flush(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send {
        async { Ok(()) }
    }
}

/// Drain `rx` into `writer` until every sender is gone. Returns the number of
/// samples written successfully.
pub(crate) async fn sink_task<O, S>(
    writer: Arc<Mutex<S>>,
    mut rx: mpsc::Receiver<Sample<O>>,
    batch_size: usize,
) -> u64
where
    O: Outcome,
    S: SampleWriter<O>,
{
    let mut writer = writer.lock().await;
    let mut batch = Vec::with_capacity(batch_size);
    let mut written = 0u64;
    let mut failed = 0u64;

    loop {
        // Receive the first sample or end the loop once the run is complete
        match rx.recv().await {
            Some(sample) => batch.push(sample),
            None => break,
        }

        // Pick up whatever else is already queued
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(sample) => batch.push(sample),
                Err(_) => break,
            }
        }

        for sample in batch.drain(..) {
            match writer.write(&sample).await {
                Ok(()) => written += 1,
                Err(e) => {
                    failed += 1;
                    tracing::error!(worker = %sample.worker, iteration = sample.iteration, "Failed to write sample: {e}");
                }
            }
        }
    }

    if let Err(e) = writer.flush().await {
        tracing::error!("Failed to flush result sink: {e}");
    }
    if failed > 0 {
        tracing::warn!(written, failed, "Some samples could not be written.");
    }
    tracing::debug!(written, "Result sink drained.");
    written
}

/// Writes one JSON object per line.
///
/// Each line carries `start_time` (seconds since the Unix epoch), `workerID`,
/// `duration` (seconds), `test_case`, `test_suite`, `status`, `error_msg`,
/// `error_trace` and `extras` (the serialized outcome).
pub struct LdjsonWriter {
    out: BufWriter<File>,
    suite: String,
    line: Vec<u8>,
}

#[derive(Serialize)]
struct ReportLine<'a, O> {
    start_time: f64,
    #[serde(rename = "workerID")]
    worker_id: WorkerId,
    duration: f64,
    test_case: &'a str,
    test_suite: &'a str,
    status: Status,
    error_msg: Option<String>,
    error_trace: Option<&'a str>,
    extras: Option<&'a O>,
}

impl LdjsonWriter {
    /// Create (or truncate) the report file.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = File::create(path).await?;
        Ok(Self {
            out: BufWriter::new(file),
            suite: "surge".to_string(),
            line: Vec::with_capacity(512),
        })
    }

    /// Value of the `test_suite` field.
    pub fn with_suite(mut self, suite: impl Into<String>) -> Self {
        self.suite = suite.into();
        self
    }
}

impl<O: Outcome> SampleWriter<O> for LdjsonWriter {
    async fn write(&mut self, sample: &Sample<O>) -> Result<(), SinkError> {
        let (error_msg, error_trace, extras) = match &sample.result {
            Ok(outcome) => (outcome.error_message(), outcome.error_trace(), Some(outcome)),
            Err(e) => (Some(e.message.clone()), e.trace.as_deref(), None),
        };
        let line = ReportLine {
            start_time: sample
                .started_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            worker_id: sample.worker,
            duration: sample.elapsed.as_secs_f64(),
            test_case: &sample.scenario,
            test_suite: &self.suite,
            status: sample.status(),
            error_msg,
            error_trace,
            extras,
        };

        self.line.clear();
        serde_json::to_writer(&mut self.line, &line)?;
        self.line.push(b'\n');
        self.out.write_all(&self.line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush().await?;
        Ok(())
    }
}

/// Keeps samples in memory. Clones share the same buffer, so a handle kept
/// outside the orchestrator can inspect what was written.
#[derive(Debug)]
pub struct MemoryWriter<O> {
    samples: Arc<StdMutex<Vec<Sample<O>>>>,
}

impl<O> Clone for MemoryWriter<O> {
    fn clone(&self) -> Self {
        Self {
            samples: self.samples.clone(),
        }
    }
}

impl<O> Default for MemoryWriter<O> {
    fn default() -> Self {
        Self {
            samples: Arc::new(StdMutex::new(Vec::new())),
        }
    }
}

impl<O: Clone> MemoryWriter<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample<O>> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<O: Outcome + Clone> SampleWriter<O> for MemoryWriter<O> {
    async fn write(&mut self, sample: &Sample<O>) -> Result<(), SinkError> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(iteration: u64, result: Result<u32, WorkloadError>) -> Sample<u32> {
        Sample {
            worker: WorkerId::new(2),
            iteration,
            scenario: Arc::from("login"),
            started_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            elapsed: Duration::from_millis(250),
            result,
        }
    }

    struct FlakyWriter {
        calls: u64,
        flushed: bool,
    }

    impl SampleWriter<u32> for FlakyWriter {
        async fn write(&mut self, _: &Sample<u32>) -> Result<(), SinkError> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(std::io::Error::other("disk full").into());
            }
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), SinkError> {
            self.flushed = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn sink_drains_everything_queued_before_close() {
        let writer = MemoryWriter::new();
        let (tx, rx) = mpsc::channel(64);
        for i in 1..=50 {
            tx.send(sample(i, Ok(i as u32))).await.unwrap();
        }
        drop(tx);

        let written = sink_task(Arc::new(Mutex::new(writer.clone())), rx, 8).await;
        assert_eq!(written, 50);
        let iterations: Vec<u64> = writer.samples().iter().map(|s| s.iteration).collect();
        assert_eq!(iterations, (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn sink_counts_failed_writes_and_still_flushes() {
        let writer = Arc::new(Mutex::new(FlakyWriter {
            calls: 0,
            flushed: false,
        }));
        let (tx, rx) = mpsc::channel(16);
        for i in 1..=6 {
            tx.send(sample(i, Ok(0))).await.unwrap();
        }
        drop(tx);

        let written = sink_task(writer.clone(), rx, 4).await;
        assert_eq!(written, 3);
        let writer = writer.lock().await;
        assert_eq!(writer.calls, 6);
        assert!(writer.flushed);
    }

    #[tokio::test]
    async fn ldjson_lines_have_report_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.ldjson");

        let mut writer = LdjsonWriter::create(&path).await.unwrap().with_suite("smoke");
        writer.write(&sample(1, Ok(7))).await.unwrap();
        writer
            .write(&sample(
                2,
                Err(WorkloadError::new("connection refused").with_trace("at line 3")),
            ))
            .await
            .unwrap();
        SampleWriter::<u32>::flush(&mut writer).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        let ok = &lines[0];
        assert_eq!(ok["start_time"], 1_700_000_000.0);
        assert_eq!(ok["workerID"], "worker_2");
        assert_eq!(ok["duration"], 0.25);
        assert_eq!(ok["test_case"], "login");
        assert_eq!(ok["test_suite"], "smoke");
        assert_eq!(ok["status"], "PASSED");
        assert_eq!(ok["error_msg"], serde_json::Value::Null);
        assert_eq!(ok["extras"], 7);

        let broken = &lines[1];
        assert_eq!(broken["status"], "BROKEN");
        assert_eq!(broken["error_msg"], "connection refused");
        assert_eq!(broken["error_trace"], "at line 3");
        assert_eq!(broken["extras"], serde_json::Value::Null);
    }

    #[test]
    fn memory_writer_clones_share_storage() {
        let writer: MemoryWriter<u32> = MemoryWriter::new();
        let handle = writer.clone();
        assert!(handle.is_empty());
        writer
            .samples
            .lock()
            .unwrap()
            .push(sample(1, Ok(1)));
        assert_eq!(handle.len(), 1);
    }
}
