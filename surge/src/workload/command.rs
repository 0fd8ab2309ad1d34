use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::Command;
use typed_builder::TypedBuilder;

use super::{Outcome, Status, Workload};
use crate::{error::WorkloadError, pool::WorkerId};

/// Runs an external program once per execution.
///
/// A zero exit status is a pass, anything else is a failure. A program that
/// cannot be spawned at all produces a [`WorkloadError`]. The worker identity
/// is exposed to the child as `SURGE_WORKER`.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CommandWorkload {
    #[builder(setter(into))]
    pub program: String,
    #[builder(default)]
    pub args: Vec<String>,
    #[builder(default, setter(strip_option, into))]
    pub working_dir: Option<PathBuf>,
    /// Label used in reports. Defaults to the program name.
    #[builder(default, setter(strip_option, into))]
    pub label: Option<String>,
    /// How many trailing bytes of stdout/stderr to keep per execution.
    #[builder(default = 4096)]
    pub output_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Outcome for CommandOutcome {
    fn status(&self) -> Status {
        if self.exit_code == Some(0) {
            Status::Passed
        } else {
            Status::Failed
        }
    }

    fn error_message(&self) -> Option<String> {
        match self.exit_code {
            Some(0) => None,
            Some(code) => Some(format!("exited with status {code}")),
            None => Some("terminated by signal".to_string()),
        }
    }

    fn error_trace(&self) -> Option<&str> {
        (self.exit_code != Some(0) && !self.stderr.is_empty()).then_some(self.stderr.as_str())
    }
}

impl Workload for CommandWorkload {
    type Outcome = CommandOutcome;

    fn name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.program)
    }

    async fn prepare(&self) -> Result<(), WorkloadError> {
        if self.program.trim().is_empty() {
            return Err(WorkloadError::nothing_to_execute("no program was given"));
        }
        if resolve_program(&self.program, self.working_dir.as_deref())
            .await
            .is_none()
        {
            return Err(WorkloadError::nothing_to_execute(format!(
                "program `{}` was not found",
                self.program
            )));
        }
        Ok(())
    }

    fn execute(
        &self,
        worker: WorkerId,
    ) -> impl Future<Output = Result<CommandOutcome, WorkloadError>> + Send {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("SURGE_WORKER", worker.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let limit = self.output_limit;
        let program = self.program.clone();

        async move {
            let output = command.output().await.map_err(|e| {
                WorkloadError::new(format!("failed to run `{program}`: {e}"))
            })?;
            Ok(CommandOutcome {
                exit_code: output.status.code(),
                stdout: tail(&output.stdout, limit),
                stderr: tail(&output.stderr, limit),
            })
        }
    }
}

/// Finds the file that would be executed for `program`, looking it up on
/// `PATH` when it is a bare name.
async fn resolve_program(program: &str, working_dir: Option<&Path>) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        let path = match working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        return is_file(&path).await.then_some(path);
    }

    let search = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&search) {
        for candidate in candidates(&dir, program) {
            if is_file(&candidate).await {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(windows)]
fn candidates(dir: &Path, program: &str) -> Vec<PathBuf> {
    vec![dir.join(program), dir.join(format!("{program}.exe"))]
}

#[cfg(not(windows))]
fn candidates(dir: &Path, program: &str) -> Vec<PathBuf> {
    vec![dir.join(program)]
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

fn tail(bytes: &[u8], limit: usize) -> String {
    let mut start = bytes.len().saturating_sub(limit);
    // Never start in the middle of a UTF-8 sequence.
    while start < bytes.len() && bytes[start] & 0xC0 == 0x80 {
        start += 1;
    }
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
