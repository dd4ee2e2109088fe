use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stack_backup_core::{RunKind, RunOutcome, RunSummary, Stack, StackOutcome, StackPhase};
use stack_backup_storage::{extract_archive, resolve_archive};
use tracing::warn;

use crate::engine::{describe_join_error, Engine, EngineInner, EnginePhase, RunHandle, TriggerError};

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub archive: String,
    pub stack: String,
    /// Permit restoring an archive taken from a differently named stack.
    #[serde(default)]
    pub allow_cross_stack: bool,
    /// Stop the stack before extracting if it is running.
    #[serde(default = "yes")]
    pub stop_stack: bool,
    /// Start the stack again if the restore stopped it.
    #[serde(default = "yes")]
    pub start_after: bool,
}

impl RestoreRequest {
    pub fn new(archive: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            stack: stack.into(),
            allow_cross_stack: false,
            stop_stack: true,
            start_after: true,
        }
    }
}

impl Engine {
    /// Starts a restore on a worker task. Shares the single-flight lock with
    /// backups; the archive name and target stack are validated before the
    /// request is accepted.
    pub async fn trigger_restore(&self, request: RestoreRequest) -> Result<RunHandle, TriggerError> {
        let guard = self.inner.lock.try_acquire().ok_or(TriggerError::Busy)?;
        self.inner.set_phase(EnginePhase::Validating);

        let (stack, cross_stack, archive_path) = match self.inner.prepare_restore(&request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.inner.set_phase(EnginePhase::Idle);
                warn!(error = %e, archive = %request.archive, "restore request rejected");
                return Err(e);
            }
        };

        let run = RunSummary::begin(RunKind::Restore, vec![stack.name.clone()], Utc::now());
        let run_id = run.id;
        self.inner.publish(&run);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner
                .run_restore(run, stack, cross_stack, archive_path, request)
                .await
        });
        Ok(RunHandle::new(run_id, task))
    }
}

impl EngineInner {
    async fn prepare_restore(
        &self,
        request: &RestoreRequest,
    ) -> Result<(Stack, bool, PathBuf), TriggerError> {
        let stack = self
            .resolve_stacks(std::slice::from_ref(&request.stack))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TriggerError::InvalidRequest("no stack selected".into()))?;
        let (name, path) = resolve_archive(
            &self.settings.backup_dir,
            &request.archive,
            &stack.name,
            request.allow_cross_stack,
        )
        .map_err(|e| TriggerError::InvalidRequest(e.to_string()))?;
        let cross_stack = name.stack() != stack.name;
        Ok((stack, cross_stack, path))
    }

    async fn run_restore(
        self: Arc<Self>,
        mut run: RunSummary,
        stack: Stack,
        cross_stack: bool,
        archive_path: PathBuf,
        request: RestoreRequest,
    ) -> RunSummary {
        let run_log = self.logs.begin_run(RunKind::Restore, run.started_at);
        run.log_file = run_log.file_name().map(str::to_owned);
        self.publish(&run);

        self.logs.success(format!(
            "Restore run {} started: {} -> {}",
            run.id, request.archive, stack.name
        ));
        if cross_stack {
            self.logs.warning(format!(
                "{} was taken from another stack; restoring onto {} as explicitly allowed",
                request.archive, stack.name
            ));
        }

        let name = stack.name.clone();
        let worker = Arc::clone(&self);
        let outcome = match tokio::spawn(worker.restore_stack(stack, archive_path, request)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = describe_join_error(e);
                self.logs
                    .error(format!("Unexpected fault while restoring {name}: {message}"));
                let mut outcome = StackOutcome::new(&name);
                outcome.record_failure(StackPhase::Fault, message);
                outcome
            }
        };
        run.stack_outcomes.push(outcome);

        match run.finish(Utc::now()) {
            RunOutcome::Success => self.logs.success(format!("Restore of {name} complete")),
            _ => self.logs.error(format!(
                "Restore of {name} failed; check the stack directory, it may be partially restored"
            )),
        }

        drop(run_log);
        self.complete(&run);
        run
    }

    async fn restore_stack(
        self: Arc<Self>,
        stack: Stack,
        archive_path: PathBuf,
        request: RestoreRequest,
    ) -> StackOutcome {
        let name = stack.name.clone();
        let mut outcome = StackOutcome::new(&name);

        let mut stop_attempted = false;
        let mut stopped = true;
        if request.stop_stack && stack.skip_stop {
            self.logs
                .info(format!("{name} is in the skip-stop list; restoring while it runs"));
        } else if request.stop_stack {
            match self.controller.is_running(&stack).await {
                Ok(true) => {
                    self.set_phase(EnginePhase::Stopping(name.clone()));
                    self.logs.info(format!("Stopping stack: {name}"));
                    stop_attempted = true;
                    if let Err(e) = self.controller.stop(&stack).await {
                        self.logs
                            .error(format!("{e}; not extracting over a running stack"));
                        outcome.record_failure(StackPhase::Stop, e.cause);
                        stopped = false;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    self.logs
                        .error(format!("{e}; not extracting over a stack in unknown state"));
                    outcome.record_failure(StackPhase::Stop, e.cause);
                    stopped = false;
                }
            }
        }

        if stopped {
            self.set_phase(EnginePhase::Extracting(name.clone()));
            self.logs.info(format!(
                "Extracting {} into {}",
                request.archive,
                stack.path.display()
            ));
            let target = stack.path.clone();
            let extracted =
                tokio::task::spawn_blocking(move || extract_archive(&archive_path, &target)).await;
            match extracted {
                Ok(Ok(report)) => self.logs.success(format!(
                    "Restored {} file(s) and {} director(ies) into {name}",
                    report.files, report.directories
                )),
                Ok(Err(e)) => {
                    self.logs.error(format!(
                        "Restore failed for {name}: {e}. No rollback is performed"
                    ));
                    outcome.record_failure(StackPhase::Extract, e.to_string());
                }
                Err(e) => {
                    let message = describe_join_error(e);
                    self.logs
                        .error(format!("Extraction crashed for {name}: {message}"));
                    outcome.record_failure(StackPhase::Extract, message);
                }
            }
        }

        if stop_attempted && request.start_after {
            self.set_phase(EnginePhase::Starting(name.clone()));
            self.logs.info(format!("Starting stack: {name}"));
            match self.controller.start(&stack).await {
                Ok(()) => self.logs.info(format!("Started {name}")),
                Err(e) => {
                    self.logs.error(e.to_string());
                    outcome.record_failure(StackPhase::Start, e.cause);
                }
            }
        } else if stop_attempted {
            self.logs.info(format!("Leaving {name} stopped as requested"));
        }

        outcome
    }
}
