use std::fmt;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use stack_backup_core::Stack;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOp {
    Stop,
    Start,
    Status,
}

impl fmt::Display for StackOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StackOp::Stop => "stop",
            StackOp::Start => "start",
            StackOp::Status => "check status of",
        })
    }
}

#[derive(Debug, Error)]
#[error("failed to {op} stack {stack}: {cause}")]
pub struct StackError {
    pub stack: String,
    pub op: StackOp,
    pub cause: String,
}

impl StackError {
    pub fn new(stack: &Stack, op: StackOp, cause: impl fmt::Display) -> Self {
        Self {
            stack: stack.name.clone(),
            op,
            cause: cause.to_string(),
        }
    }
}

/// Stops and starts stacks through an external orchestrator.
///
/// `stop` and `start` are idempotent. Implementations never retry and never
/// consult the skip-stop list; both are the caller's business.
#[async_trait]
pub trait StackController: Send + Sync {
    async fn stop(&self, stack: &Stack) -> Result<(), StackError>;

    async fn start(&self, stack: &Stack) -> Result<(), StackError>;

    /// Whether any container of the stack is up. A status query that cannot
    /// be answered is an error with [`StackOp::Status`], never `false`.
    async fn is_running(&self, stack: &Stack) -> Result<bool, StackError>;
}

#[derive(Debug, Clone)]
pub struct ComposeConfig {
    pub docker_bin: String,
    /// Upper bound for `down` / `up -d`.
    pub command_timeout: Duration,
    /// Upper bound for `ps -q`.
    pub status_timeout: Duration,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_owned(),
            command_timeout: Duration::from_secs(120),
            status_timeout: Duration::from_secs(10),
        }
    }
}

/// Drives stacks with `docker compose`, run from the stack directory.
#[derive(Debug, Clone, Default)]
pub struct ComposeController {
    config: ComposeConfig,
}

impl ComposeController {
    pub fn new(config: ComposeConfig) -> Self {
        Self { config }
    }

    async fn compose(&self, stack: &Stack, args: &[&str], limit: Duration) -> Result<Output> {
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.arg("compose")
            .args(args)
            .current_dir(&stack.path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let joined = args.join(" ");
        let out = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| anyhow!("docker compose {joined} timed out after {}s", limit.as_secs_f32()))?
            .with_context(|| format!("failed to run docker compose {joined}"))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stdout = String::from_utf8_lossy(&out.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(anyhow!(
                "docker compose {joined} failed ({}): {}",
                out.status,
                detail.trim()
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl StackController for ComposeController {
    async fn stop(&self, stack: &Stack) -> Result<(), StackError> {
        if !self.is_running(stack).await? {
            debug!(stack = %stack.name, "already stopped");
            return Ok(());
        }
        self.compose(stack, &["down"], self.config.command_timeout)
            .await
            .map(drop)
            .map_err(|e| StackError::new(stack, StackOp::Stop, format!("{e:#}")))
    }

    async fn start(&self, stack: &Stack) -> Result<(), StackError> {
        if self.is_running(stack).await? {
            debug!(stack = %stack.name, "already running");
            return Ok(());
        }
        self.compose(stack, &["up", "-d"], self.config.command_timeout)
            .await
            .map(drop)
            .map_err(|e| StackError::new(stack, StackOp::Start, format!("{e:#}")))
    }

    async fn is_running(&self, stack: &Stack) -> Result<bool, StackError> {
        let out = self
            .compose(stack, &["ps", "-q"], self.config.status_timeout)
            .await
            .map_err(|e| StackError::new(stack, StackOp::Status, format!("{e:#}")))?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .any(|l| !l.trim().is_empty()))
    }
}
