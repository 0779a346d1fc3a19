//! Workflow runner
//!
//! The worker treats workflow execution as a black box: given a job and its
//! parameter file, a [`WorkflowRunner`] runs the workflow and hands back the
//! captured output. [`CommandRunner`] launches an external command, a
//! container engine by default.

use async_trait::async_trait;
use flotilla_core::domain::job::Job;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Output captured from a workflow run, passed on verbatim
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("workflow exited with code {code}: {}", .output.stderr.trim())]
    Failed { code: i32, output: RunOutput },

    #[error("failed to launch workflow: {0}")]
    Launch(#[from] std::io::Error),
}

impl RunnerError {
    /// Output captured before the failure, if any
    pub fn output(&self) -> Option<&RunOutput> {
        match self {
            RunnerError::Failed { output, .. } => Some(output),
            RunnerError::Launch(_) => None,
        }
    }
}

/// Runs one workflow to completion
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run(&self, job: &Job, params: &Path) -> Result<RunOutput, RunnerError>;
}

/// Runner that launches an external program per job
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    image: String,
}

impl CommandRunner {
    /// Creates a runner from a program and argument templates
    ///
    /// Arguments may contain `{workflow}`, `{params}` and `{image}`.
    pub fn new(program: impl Into<String>, args: Vec<String>, image: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            image: image.into(),
        }
    }

    /// Splits a whitespace-separated command line into program and arguments
    ///
    /// Placeholders are substituted after splitting, so paths containing
    /// spaces survive intact.
    pub fn from_command_line(command: &str, image: impl Into<String>) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), image))
    }

    fn render(&self, job: &Job, params: &Path) -> Vec<String> {
        let params = params.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{workflow}", &job.workflow_path)
                    .replace("{params}", &params)
                    .replace("{image}", &self.image)
            })
            .collect()
    }
}

#[async_trait]
impl WorkflowRunner for CommandRunner {
    async fn run(&self, job: &Job, params: &Path) -> Result<RunOutput, RunnerError> {
        let args = self.render(job, params);
        info!(
            "Running {} {} for job {}",
            job.workflow_name, job.workflow_version, job.job_uuid
        );
        debug!("Runner command: {} {:?}", self.program, args);

        let output = Command::new(&self.program).args(&args).output().await?;

        let captured = RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !output.status.success() {
            // Killed by a signal leaves no exit code
            let code = output.status.code().unwrap_or(-1);
            debug!(
                "Workflow failed: exit_code={} stdout_len={} stderr_len={}",
                code,
                captured.stdout.len(),
                captured.stderr.len()
            );
            return Err(RunnerError::Failed {
                code,
                output: captured,
            });
        }

        debug!(
            "Workflow completed: stdout_len={}, stderr_len={}",
            captured.stdout.len(),
            captured.stderr.len()
        );
        Ok(captured)
    }
}
