use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use utils::text::truncate_to_char_boundary;
use uuid::Uuid;

use crate::{
    args::{CONTAINER_PREFIX, RunRequest, SandboxProfile, build_run_args, container_name},
    result::{AgentResult, parse_stdout},
};

const ERROR_DETAIL_MAX: usize = 2000;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container terminated by timeout or cancel")]
    Terminated,
    #[error("agent exited with code {code}: {detail}")]
    Exec { code: i32, detail: String },
    #[error("agent produced empty output")]
    EmptyOutput,
    #[error("failed to parse agent output: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw capture plus the decoded outcome of one agent invocation. The raw
/// streams are always returned so callers can persist turn artifacts even
/// when the run failed.
#[derive(Debug)]
pub struct TurnOutput {
    pub stdout: String,
    pub stderr: String,
    pub result: Result<AgentResult, SandboxError>,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run the agent CLI once. Stdout is teed to `live_log` while the run
    /// is in flight. Cancellation kills and removes the container and
    /// yields a `terminated` error.
    async fn run_turn(
        &self,
        req: &RunRequest,
        live_log: Option<&Path>,
        cancel: &CancellationToken,
    ) -> TurnOutput;

    /// Best-effort kill on the task's well-known container name.
    async fn kill_container(&self, task_id: Uuid);

    /// Names of live task containers (`wf-*`), for crash recovery.
    async fn list_live_containers(&self) -> Result<Vec<String>, SandboxError>;
}

pub struct DockerInvoker {
    profile: SandboxProfile,
}

impl DockerInvoker {
    pub fn new(profile: SandboxProfile) -> Self {
        DockerInvoker { profile }
    }

    pub fn profile(&self) -> &SandboxProfile {
        &self.profile
    }

    async fn runtime(&self, args: &[&str]) -> Result<String, SandboxError> {
        let out = Command::new(&self.profile.runtime_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(SandboxError::Exec {
                code: out.status.code().unwrap_or(-1),
                detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn force_remove(&self, name: &str) {
        if let Err(e) = self.runtime(&["kill", name]).await {
            debug!("container kill for {name}: {e}");
        }
        if let Err(e) = self.runtime(&["rm", "-f", name]).await {
            debug!("container rm for {name}: {e}");
        }
    }

    async fn execute(
        &self,
        req: &RunRequest,
        live_log: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutput, SandboxError> {
        let name = container_name(&req.task_id, req.container_suffix.as_deref());

        // A leftover container with this name (crashed server, unfinished
        // cancel) would make `run --name` fail.
        if let Err(e) = self.runtime(&["rm", "-f", name.as_str()]).await {
            debug!("preemptive container rm for {name}: {e}");
        }

        let args = build_run_args(&self.profile, req);
        debug!(container = %name, "launching agent: {} {:?}", self.profile.runtime_bin, args);

        let mut child = Command::new(&self.profile.runtime_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr_pipe);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let mut live = match live_log {
            Some(path) => Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
            None => None,
        };

        let mut stdout_buf = String::new();
        let mut lines = BufReader::new(stdout_pipe).lines();
        let cancelled = loop {
            tokio::select! {
                _ = cancel.cancelled() => break true,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        stdout_buf.push_str(&line);
                        stdout_buf.push('\n');
                        if let Some(f) = live.as_mut() {
                            let _ = f.write_all(line.as_bytes()).await;
                            let _ = f.write_all(b"\n").await;
                        }
                    }
                    Ok(None) => break false,
                    Err(e) => {
                        warn!("reading agent stdout failed: {e}");
                        break false;
                    }
                }
            }
        };

        if cancelled {
            self.force_remove(&name).await;
            let _ = child.kill().await;
            let stderr = stderr_task.await.unwrap_or_default();
            return Ok(TurnOutput {
                stdout: stdout_buf,
                stderr,
                result: Err(SandboxError::Terminated),
            });
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);

        let result = match parse_stdout(&stdout_buf) {
            Some(parsed) => {
                if !status.success() {
                    warn!(
                        container = %name,
                        "agent exited with code {exit_code} but produced a parseable result"
                    );
                }
                Ok(parsed)
            }
            None if stdout_buf.trim().is_empty() => Err(SandboxError::EmptyOutput),
            None if !status.success() => Err(SandboxError::Exec {
                code: exit_code,
                detail: format!(
                    "stdout: {} | stderr: {}",
                    truncate_to_char_boundary(&stdout_buf, ERROR_DETAIL_MAX),
                    truncate_to_char_boundary(&stderr, ERROR_DETAIL_MAX),
                ),
            }),
            None => Err(SandboxError::Parse(
                truncate_to_char_boundary(&stdout_buf, ERROR_DETAIL_MAX).to_string(),
            )),
        };

        Ok(TurnOutput {
            stdout: stdout_buf,
            stderr,
            result,
        })
    }
}

#[async_trait]
impl AgentInvoker for DockerInvoker {
    async fn run_turn(
        &self,
        req: &RunRequest,
        live_log: Option<&Path>,
        cancel: &CancellationToken,
    ) -> TurnOutput {
        match self.execute(req, live_log, cancel).await {
            Ok(output) => output,
            Err(e) => TurnOutput {
                stdout: String::new(),
                stderr: String::new(),
                result: Err(e),
            },
        }
    }

    async fn kill_container(&self, task_id: Uuid) {
        let name = container_name(&task_id, None);
        if let Err(e) = self.runtime(&["kill", name.as_str()]).await {
            debug!("kill container {name}: {e}");
        }
    }

    async fn list_live_containers(&self) -> Result<Vec<String>, SandboxError> {
        let filter = format!("name={CONTAINER_PREFIX}");
        let out = self
            .runtime(&["ps", "--filter", filter.as_str(), "--format", "{{.Names}}"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
