use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use stack_backup_core::{validate_stack_name, Stack};
use tracing::{debug, warn};

use crate::controller::StackController;

/// Source of the stacks a request may name.
#[async_trait]
pub trait StackCatalog: Send + Sync {
    /// All known stacks, sorted by name, without asking the orchestrator
    /// about them. `running` is always `false`.
    async fn discover(&self) -> Result<Vec<Stack>>;

    /// Like [`discover`](Self::discover), with `running` filled in per stack.
    async fn list_stacks(&self) -> Result<Vec<Stack>>;
}

/// Treats every visible sub-directory of `stacks_dir` as a stack.
pub struct DirectoryCatalog {
    stacks_dir: PathBuf,
    skip_stop: BTreeSet<String>,
    controller: Arc<dyn StackController>,
}

impl DirectoryCatalog {
    pub fn new(
        stacks_dir: impl Into<PathBuf>,
        skip_stop: impl IntoIterator<Item = String>,
        controller: Arc<dyn StackController>,
    ) -> Self {
        Self {
            stacks_dir: stacks_dir.into(),
            skip_stop: skip_stop.into_iter().collect(),
            controller,
        }
    }
}

#[async_trait]
impl StackCatalog for DirectoryCatalog {
    async fn discover(&self) -> Result<Vec<Stack>> {
        let mut read_dir = match tokio::fs::read_dir(&self.stacks_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("listing stacks in {}", self.stacks_dir.display()))
            }
        };

        let mut stacks = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .with_context(|| format!("listing stacks in {}", self.stacks_dir.display()))?
        {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if validate_stack_name(&name).is_err() {
                debug!(dir = %name, "ignoring directory with unusable stack name");
                continue;
            }
            stacks.push(Stack {
                skip_stop: self.skip_stop.contains(&name),
                path: entry.path(),
                name,
                running: false,
            });
        }
        stacks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stacks)
    }

    async fn list_stacks(&self) -> Result<Vec<Stack>> {
        let mut stacks = self.discover().await?;
        for stack in &mut stacks {
            stack.running = match self.controller.is_running(stack).await {
                Ok(running) => running,
                Err(e) => {
                    warn!(stack = %stack.name, error = %e, "listing stack as not running");
                    false
                }
            };
        }
        Ok(stacks)
    }
}
