use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Backup,
    Restore,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Backup => "backup",
            RunKind::Restore => "restore",
        }
    }
}

/// Step of a stack's processing that a failure is attributed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StackPhase {
    Stop,
    Archive,
    Start,
    Extract,
    /// Unexpected fault caught at the per-stack boundary.
    Fault,
}

impl fmt::Display for StackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StackPhase::Stop => "stop",
            StackPhase::Archive => "archive",
            StackPhase::Start => "start",
            StackPhase::Extract => "extract",
            StackPhase::Fault => "fault",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFailure {
    pub phase: StackPhase,
    pub message: String,
}

/// Archive produced for one stack during a backup run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackOutcome {
    pub stack: String,
    pub archive: Option<ArchiveSummary>,
    pub failures: Vec<StepFailure>,
}

impl StackOutcome {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            archive: None,
            failures: Vec::new(),
        }
    }

    pub fn record_failure(&mut self, phase: StackPhase, message: impl Into<String>) {
        self.failures.push(StepFailure {
            phase,
            message: message.into(),
        });
    }

    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
        })
    }
}

impl RunOutcome {
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) if succeeded > 0 => RunOutcome::Success,
            (0, _) => RunOutcome::Failed,
            _ => RunOutcome::Partial,
        }
    }
}

/// In-memory record of one backup or restore run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub kind: RunKind,
    pub stacks: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub stack_outcomes: Vec<StackOutcome>,
    pub log_file: Option<String>,
}

impl RunSummary {
    pub fn begin(kind: RunKind, stacks: Vec<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            stacks,
            started_at,
            finished_at: None,
            outcome: None,
            stack_outcomes: Vec::new(),
            log_file: None,
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.stack_outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.stack_outcomes.len() - self.succeeded_count()
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) -> RunOutcome {
        let outcome = RunOutcome::from_counts(self.succeeded_count(), self.failed_count());
        self.finished_at = Some(finished_at);
        self.outcome = Some(outcome);
        outcome
    }
}
