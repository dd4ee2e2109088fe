//! Filename grammar for archives and run logs.
//!
//! Artifacts carry all of their metadata in their names, so this module is
//! the only place allowed to build or take apart those names. Version 1 of
//! the grammar:
//!
//! ```text
//! archive  = stack "_" timestamp ".tar.gz"
//! log      = ("backup" | "restore") "_" timestamp ".log"
//! timestamp = YYYY "-" MM "-" DD "_" hh "-" mm "-" ss      (UTC)
//! stack    = 1*( ALPHA / DIGIT / "-" / "_" / "." ), not starting with "."
//! ```
//!
//! Anything that does not round-trip through [`ArchiveName::parse`] /
//! [`LogFileName::parse`] is rejected.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::RunKind;

pub const NAME_FORMAT_VERSION: u32 = 1;

/// `strftime` pattern shared by archive and log names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const TIMESTAMP_LEN: usize = 19;
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const LOG_SUFFIX: &str = ".log";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("invalid stack name: {0:?}")]
    InvalidStack(String),
    #[error("{0:?} does not match <stack>_<YYYY-MM-DD_HH-MM-SS>.tar.gz")]
    InvalidArchiveName(String),
    #[error("{0:?} does not match backup_|restore_<YYYY-MM-DD_HH-MM-SS>.log")]
    InvalidLogName(String),
}

/// Checks that a stack name is safe to embed in a path component.
pub fn validate_stack_name(name: &str) -> Result<(), NameError> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(NameError::InvalidStack(name.to_owned()))
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Strict inverse of [`format_timestamp`].
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.len() != TIMESTAMP_LEN {
        return None;
    }
    let parsed = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    // chrono tolerates unpadded fields; only the canonical spelling is accepted
    (format_timestamp(parsed) == raw).then_some(parsed)
}

fn truncate_to_secs(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(0).unwrap_or(at)
}

/// Decoded form of `<stack>_<timestamp>.tar.gz`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveName {
    stack: String,
    created_at: DateTime<Utc>,
}

impl ArchiveName {
    pub fn new(stack: &str, created_at: DateTime<Utc>) -> Result<Self, NameError> {
        validate_stack_name(stack)?;
        Ok(Self {
            stack: stack.to_owned(),
            created_at: truncate_to_secs(created_at),
        })
    }

    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let invalid = || NameError::InvalidArchiveName(raw.to_owned());

        let stem = raw.strip_suffix(ARCHIVE_SUFFIX).ok_or_else(invalid)?;
        if stem.len() < TIMESTAMP_LEN + 2 || !stem.is_char_boundary(stem.len() - TIMESTAMP_LEN) {
            return Err(invalid());
        }
        let (head, ts) = stem.split_at(stem.len() - TIMESTAMP_LEN);
        let stack = head.strip_suffix('_').ok_or_else(invalid)?;
        let created_at = parse_timestamp(ts).ok_or_else(invalid)?;
        validate_stack_name(stack).map_err(|_| invalid())?;

        Ok(Self {
            stack: stack.to_owned(),
            created_at,
        })
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}{}",
            self.stack,
            format_timestamp(self.created_at),
            ARCHIVE_SUFFIX
        )
    }

    /// Same stack, timestamp moved forward by `secs`.
    pub fn bumped(&self, secs: i64) -> Self {
        Self {
            stack: self.stack.clone(),
            created_at: self.created_at + chrono::Duration::seconds(secs),
        }
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

impl FromStr for ArchiveName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Decoded form of `backup_<timestamp>.log` / `restore_<timestamp>.log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileName {
    kind: RunKind,
    started_at: DateTime<Utc>,
}

impl LogFileName {
    pub fn new(kind: RunKind, started_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            started_at: truncate_to_secs(started_at),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let invalid = || NameError::InvalidLogName(raw.to_owned());

        let stem = raw.strip_suffix(LOG_SUFFIX).ok_or_else(invalid)?;
        let (kind, ts) = if let Some(ts) = stem.strip_prefix("backup_") {
            (RunKind::Backup, ts)
        } else if let Some(ts) = stem.strip_prefix("restore_") {
            (RunKind::Restore, ts)
        } else {
            return Err(invalid());
        };
        let started_at = parse_timestamp(ts).ok_or_else(invalid)?;
        Ok(Self { kind, started_at })
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}{}",
            self.kind.as_str(),
            format_timestamp(self.started_at),
            LOG_SUFFIX
        )
    }
}

impl fmt::Display for LogFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}
