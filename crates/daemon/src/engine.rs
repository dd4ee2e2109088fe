//! Backup orchestration.
//!
//! A request is validated while the single-flight lock is held, then handed
//! to a spawned worker that owns the lock guard until the run ends. Each
//! stack runs in its own task so a panic in one stack becomes that stack's
//! failure instead of ending the run.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use stack_backup_compose::{StackCatalog, StackController};
use stack_backup_core::{LogLine, RunKind, RunOutcome, RunSummary, Stack, StackOutcome, StackPhase};
use stack_backup_storage::{
    build_archive, list_archives, sweep, ArchiveEntry, ArchiveOptions, SweepTarget,
};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::warn;
use uuid::Uuid;

use crate::lock::EngineLock;
use crate::log_sink::LogSink;

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize)]
pub struct EngineSettings {
    pub backup_dir: PathBuf,
    pub include_data: bool,
    pub retention_days: i64,
    pub log_retention_days: i64,
    #[serde(skip)]
    pub archive_timeout: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("a backup or restore is already in progress")]
    Busy,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("stack discovery failed: {0}")]
    Discovery(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", content = "stack", rename_all = "lowercase")]
pub enum EnginePhase {
    Idle,
    Validating,
    Stopping(String),
    Archiving(String),
    Starting(String),
    Extracting(String),
    Sweeping,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub busy: bool,
    pub phase: EnginePhase,
    pub current_run: Option<RunSummary>,
    pub last_run: Option<RunSummary>,
}

/// An accepted run. Its id is known before the worker starts.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    task: JoinHandle<RunSummary>,
}

impl RunHandle {
    pub(crate) fn new(run_id: Uuid, task: JoinHandle<RunSummary>) -> Self {
        Self { run_id, task }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Waits for the worker and returns the finished run record.
    pub async fn wait(self) -> Result<RunSummary, JoinError> {
        self.task.await
    }
}

#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) settings: EngineSettings,
    pub(crate) controller: Arc<dyn StackController>,
    pub(crate) catalog: Arc<dyn StackCatalog>,
    pub(crate) logs: LogSink,
    pub(crate) lock: EngineLock,
    tracker: Mutex<Tracker>,
}

struct Tracker {
    phase: EnginePhase,
    current: Option<RunSummary>,
    last: Option<RunSummary>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        controller: Arc<dyn StackController>,
        catalog: Arc<dyn StackCatalog>,
        logs: LogSink,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                settings,
                controller,
                catalog,
                logs,
                lock: EngineLock::new(),
                tracker: Mutex::new(Tracker {
                    phase: EnginePhase::Idle,
                    current: None,
                    last: None,
                }),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn logs(&self) -> &LogSink {
        &self.inner.logs
    }

    /// Starts a backup of `names` on a worker task.
    ///
    /// Rejected without side effects when another run holds the lock, when
    /// the selection is empty, or when any name is unknown.
    pub async fn trigger_backup(&self, names: &[String]) -> Result<RunHandle, TriggerError> {
        let guard = self.inner.lock.try_acquire().ok_or(TriggerError::Busy)?;
        self.inner.set_phase(EnginePhase::Validating);

        let stacks = match self.inner.resolve_stacks(names).await {
            Ok(stacks) => stacks,
            Err(e) => {
                self.inner.set_phase(EnginePhase::Idle);
                warn!(error = %e, "backup request rejected");
                return Err(e);
            }
        };

        let names = stacks.iter().map(|s| s.name.clone()).collect();
        let run = RunSummary::begin(RunKind::Backup, names, Utc::now());
        let run_id = run.id;
        self.inner.publish(&run);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.run_backup(run, stacks).await
        });
        Ok(RunHandle::new(run_id, task))
    }

    /// Runs only the retention sweep, under the same lock as a backup.
    /// Returns the number of deleted artifacts.
    pub async fn trigger_sweep(&self) -> Result<usize, TriggerError> {
        let _guard = self.inner.lock.try_acquire().ok_or(TriggerError::Busy)?;
        self.inner.set_phase(EnginePhase::Sweeping);
        let deleted = Arc::clone(&self.inner).sweep_retention().await;
        self.inner.set_phase(EnginePhase::Idle);
        Ok(deleted)
    }

    pub fn status(&self) -> EngineStatus {
        let busy = self.inner.lock.is_held();
        let tracker = self.inner.tracker();
        EngineStatus {
            busy,
            phase: if busy {
                tracker.phase.clone()
            } else {
                EnginePhase::Idle
            },
            current_run: if busy { tracker.current.clone() } else { None },
            last_run: tracker.last.clone(),
        }
    }

    pub fn recent_logs(&self, n: usize) -> Vec<LogLine> {
        self.inner.logs.snapshot(n)
    }

    pub fn list_archives(&self) -> io::Result<Vec<ArchiveEntry>> {
        match list_archives(&self.inner.settings.backup_dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            other => other,
        }
    }

    pub async fn list_stacks(&self) -> anyhow::Result<Vec<Stack>> {
        self.inner.catalog.list_stacks().await
    }

    /// Resolves once no run or sweep holds the lock. A stack stopped by the
    /// current run has been started again by then.
    pub async fn wait_idle(&self) {
        while self.inner.lock.is_held() {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }
}

impl EngineInner {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_phase(&self, phase: EnginePhase) {
        self.tracker().phase = phase;
    }

    pub(crate) fn publish(&self, run: &RunSummary) {
        self.tracker().current = Some(run.clone());
    }

    pub(crate) fn complete(&self, run: &RunSummary) {
        let mut tracker = self.tracker();
        tracker.phase = EnginePhase::Idle;
        tracker.current = None;
        tracker.last = Some(run.clone());
    }

    /// All-or-nothing: every name must be known, or nothing is selected.
    /// Names are checked against the catalog only; the orchestrator is not
    /// asked about any stack until the worker runs.
    pub(crate) async fn resolve_stacks(&self, names: &[String]) -> Result<Vec<Stack>, TriggerError> {
        if names.is_empty() {
            return Err(TriggerError::InvalidRequest("no stacks selected".into()));
        }
        let known = self
            .catalog
            .discover()
            .await
            .map_err(|e| TriggerError::Discovery(format!("{e:#}")))?;

        let mut selected: Vec<Stack> = Vec::new();
        let mut unknown: Vec<&str> = Vec::new();
        for name in names {
            if selected.iter().any(|s| &s.name == name) || unknown.contains(&name.as_str()) {
                continue;
            }
            match known.iter().find(|s| &s.name == name) {
                Some(stack) => selected.push(stack.clone()),
                None => unknown.push(name.as_str()),
            }
        }
        if !unknown.is_empty() {
            return Err(TriggerError::InvalidRequest(format!(
                "unknown stack(s): {}",
                unknown.join(", ")
            )));
        }
        Ok(selected)
    }

    async fn run_backup(self: Arc<Self>, mut run: RunSummary, stacks: Vec<Stack>) -> RunSummary {
        let run_log = self.logs.begin_run(RunKind::Backup, run.started_at);
        run.log_file = run_log.file_name().map(str::to_owned);
        self.publish(&run);

        self.logs.success(format!(
            "Backup run {} started: {}",
            run.id,
            run.stacks.join(", ")
        ));

        for stack in stacks {
            let name = stack.name.clone();
            let worker = Arc::clone(&self);
            let outcome = match tokio::spawn(worker.backup_stack(stack)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = describe_join_error(e);
                    self.logs
                        .error(format!("Unexpected fault while backing up {name}: {message}"));
                    let mut outcome = StackOutcome::new(&name);
                    outcome.record_failure(StackPhase::Fault, message);
                    outcome
                }
            };
            run.stack_outcomes.push(outcome);
            self.publish(&run);
        }

        self.set_phase(EnginePhase::Sweeping);
        Arc::clone(&self).sweep_retention().await;

        let outcome = run.finish(Utc::now());
        let failed: Vec<&str> = run
            .stack_outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.stack.as_str())
            .collect();
        if !failed.is_empty() {
            self.logs
                .warning(format!("Some backups failed: {}", failed.join(", ")));
        }
        let summary = format!(
            "Backup run complete ({outcome}): {} succeeded, {} failed",
            run.succeeded_count(),
            run.failed_count()
        );
        match outcome {
            RunOutcome::Success => self.logs.success(summary),
            RunOutcome::Partial => self.logs.warning(summary),
            RunOutcome::Failed => self.logs.error(summary),
        }

        drop(run_log);
        self.complete(&run);
        run
    }

    /// stop → archive → start for one stack. Step failures are recorded and
    /// the remaining steps still run; start is attempted whenever a stop was.
    async fn backup_stack(self: Arc<Self>, stack: Stack) -> StackOutcome {
        let name = stack.name.clone();
        let mut outcome = StackOutcome::new(&name);

        let mut stop_attempted = false;
        if stack.skip_stop {
            self.logs
                .info(format!("{name} is in the skip-stop list; archiving configuration while it runs"));
        } else {
            match self.controller.is_running(&stack).await {
                Ok(true) => {
                    self.set_phase(EnginePhase::Stopping(name.clone()));
                    self.logs.info(format!("Stopping stack: {name}"));
                    stop_attempted = true;
                    match self.controller.stop(&stack).await {
                        Ok(()) => self.logs.info(format!("Stopped {name}")),
                        Err(e) => {
                            self.logs.error(format!("{e}; archiving anyway"));
                            outcome.record_failure(StackPhase::Stop, e.cause);
                        }
                    }
                }
                Ok(false) => self
                    .logs
                    .info(format!("{name} is not running; archiving without stopping")),
                // state unknown: archive as-is and leave the stack alone
                Err(e) => {
                    self.logs.error(format!("{e}; archiving without stopping"));
                    outcome.record_failure(StackPhase::Stop, e.cause);
                }
            }
        }

        self.set_phase(EnginePhase::Archiving(name.clone()));
        let include_data = self.settings.include_data && !stack.skip_stop;
        self.logs.info(format!(
            "Archiving {name} ({})",
            if include_data { "configuration and data" } else { "configuration only" }
        ));
        let options = ArchiveOptions::new(include_data)
            .with_deadline(Instant::now() + self.settings.archive_timeout);
        let backup_dir = self.settings.backup_dir.clone();
        let target = stack.clone();
        let built =
            tokio::task::spawn_blocking(move || build_archive(&target, &backup_dir, &options)).await;
        match built {
            Ok(Ok(info)) => {
                self.logs.success(format!(
                    "Archive created: {} ({}, sha256 {})",
                    info.name,
                    format_size(info.size),
                    &info.sha256[..12]
                ));
                outcome.archive = Some(info.summary());
            }
            Ok(Err(e)) => {
                self.logs.error(format!("Archive failed for {name}: {e}"));
                outcome.record_failure(StackPhase::Archive, e.to_string());
            }
            Err(e) => {
                let message = describe_join_error(e);
                self.logs
                    .error(format!("Archive builder crashed for {name}: {message}"));
                outcome.record_failure(StackPhase::Archive, message);
            }
        }

        if stop_attempted {
            self.set_phase(EnginePhase::Starting(name.clone()));
            self.logs.info(format!("Starting stack: {name}"));
            match self.controller.start(&stack).await {
                Ok(()) => self.logs.info(format!("Started {name}")),
                Err(e) => {
                    self.logs.error(e.to_string());
                    outcome.record_failure(StackPhase::Start, e.cause);
                }
            }
        }

        if outcome.succeeded() {
            self.logs.success(format!("Backup of {name} succeeded"));
        } else {
            self.logs.error(format!(
                "Backup of {name} failed ({} step(s) failed)",
                outcome.failures.len()
            ));
        }
        outcome
    }

    /// Sweeps archives and run logs. Failures are logged, never propagated.
    pub(crate) async fn sweep_retention(self: Arc<Self>) -> usize {
        self.logs.info("Running retention cleanup");
        let targets = [
            (
                "backup",
                self.settings.backup_dir.clone(),
                self.settings.retention_days,
                SweepTarget::Archives,
            ),
            (
                "log",
                self.logs.log_dir().to_path_buf(),
                self.settings.log_retention_days,
                SweepTarget::Logs,
            ),
        ];

        let mut deleted = 0;
        for (label, dir, days, target) in targets {
            if days <= 0 {
                self.logs.info(format!("{label} retention disabled"));
                continue;
            }
            match tokio::task::spawn_blocking(move || sweep(&dir, days, target)).await {
                Ok(Ok(report)) => {
                    for file in &report.deleted {
                        self.logs.info(format!("Removed old {label}: {file}"));
                    }
                    for (file, err) in &report.failures {
                        self.logs.warning(format!("Could not remove {file}: {err}"));
                    }
                    deleted += report.deleted_count();
                }
                Ok(Err(e)) => self.logs.warning(format!("{label} retention skipped: {e}")),
                Err(e) => self.logs.warning(format!(
                    "{label} retention aborted: {}",
                    describe_join_error(e)
                )),
            }
        }
        self.logs
            .success(format!("Retention cleanup complete ({deleted} removed)"));
        deleted
    }
}

pub(crate) fn describe_join_error(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_owned()
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5 MB");
    }

    #[tokio::test]
    async fn panic_payload_is_described() {
        let err = tokio::spawn(async { panic!("disk on fire") })
            .await
            .unwrap_err();
        assert_eq!(describe_join_error(err), "panic: disk on fire");
    }
}
