// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job type `command`: runs `sh -c <command>`.
//!
//! The process sees the node inputs as environment variables plus:
//! - `FLOWGATE_EXECUTION_ID`, `FLOWGATE_JOB_ID`
//! - `FLOWGATE_OUTPUT_FILE`: path the job may write `KEY=VALUE` lines to
//!
//! Exit code 0 means SUCCEEDED and the output file becomes the node's
//! generated properties. Any other exit code or a timeout means FAILED.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::job::{CancelToken, JobContext, JobError, JobOutcome, JobRunner, is_cancelled};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Exit {
    Success,
    Failed { exit_code: i32, stderr: String },
    Cancelled,
    TimedOut,
}

/// Runs shell commands as jobs.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    work_dir: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    /// Create a runner writing job files under `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            work_dir: work_dir.into(),
            timeout,
        }
    }

    fn output_path(&self, execution_id: i64, job_id: &str) -> PathBuf {
        self.work_dir
            .join(execution_id.to_string())
            .join(format!("{}.out", job_id))
    }

    async fn wait_with_cancellation(
        &self,
        child: &mut Child,
        job_id: &str,
        token: &CancelToken,
        stderr_handle: Option<ChildStderr>,
    ) -> Result<Exit, JobError> {
        let start = std::time::Instant::now();

        loop {
            if is_cancelled(token) {
                warn!(job_id, "Job cancelled, killing process");
                let _ = child.kill().await;
                return Ok(Exit::Cancelled);
            }

            if start.elapsed() > self.timeout {
                warn!(job_id, timeout_secs = self.timeout.as_secs(), "Job timed out, killing process");
                let _ = child.kill().await;
                return Ok(Exit::TimedOut);
            }

            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(Exit::Success),
                Ok(Some(status)) => {
                    let stderr = match stderr_handle {
                        Some(mut handle) => {
                            let mut buf = String::new();
                            let _ = handle.read_to_string(&mut buf).await;
                            buf.trim().to_string()
                        }
                        None => String::new(),
                    };
                    return Ok(Exit::Failed {
                        exit_code: status.code().unwrap_or(-1),
                        stderr,
                    });
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    error!(job_id, error = %e, "Error waiting for job process");
                    return Err(JobError::Io(e));
                }
            }
        }
    }

    async fn spawn_and_wait(
        &self,
        ctx: &JobContext,
        command: &str,
        output_file: &Path,
        token: &CancelToken,
    ) -> Result<JobOutcome, JobError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(&ctx.inputs)
            .env("FLOWGATE_EXECUTION_ID", ctx.execution_id.to_string())
            .env("FLOWGATE_JOB_ID", &ctx.job_id)
            .env("FLOWGATE_OUTPUT_FILE", output_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::Launch(format!("failed to spawn '{}': {}", command, e)))?;
        let stderr = child.stderr.take();

        match self
            .wait_with_cancellation(&mut child, &ctx.job_id, token, stderr)
            .await?
        {
            Exit::Success => {
                let generated = match tokio::fs::read_to_string(output_file).await {
                    Ok(content) => parse_properties(&content),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
                    Err(e) => return Err(JobError::Io(e)),
                };
                info!(
                    execution_id = ctx.execution_id,
                    job_id = %ctx.job_id,
                    properties = generated.len(),
                    "Job completed successfully"
                );
                Ok(JobOutcome::succeeded(generated))
            }
            Exit::Failed { exit_code, stderr } => {
                error!(
                    execution_id = ctx.execution_id,
                    job_id = %ctx.job_id,
                    exit_code,
                    stderr = %stderr,
                    "Job failed"
                );
                Ok(JobOutcome::failed())
            }
            Exit::TimedOut => Ok(JobOutcome::failed()),
            Exit::Cancelled => Ok(JobOutcome::killed()),
        }
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    fn job_type(&self) -> &'static str {
        "command"
    }

    async fn run(&self, ctx: &JobContext, cancel_token: CancelToken) -> Result<JobOutcome, JobError> {
        let command = ctx
            .config
            .get("command")
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| JobError::InvalidConfig("'command' is required".to_string()))?;

        let output_file = self.output_path(ctx.execution_id, &ctx.job_id);
        if let Some(parent) = output_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(&output_file).await;

        self.spawn_and_wait(ctx, command, &output_file, &cancel_token)
            .await
    }
}

/// Parse `KEY=VALUE` lines. Blank lines and lines starting with `#` are
/// skipped, as are lines without `=`. Later keys win.
pub fn parse_properties(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}
