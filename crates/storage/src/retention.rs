use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use stack_backup_core::{ArchiveName, LogFileName};
use thiserror::Error;
use tracing::warn;

use crate::archive::TEMP_PREFIX;

/// Which artifacts a sweep considers and how their age is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTarget {
    /// `<stack>_<ts>.tar.gz`, aged by the timestamp in the name.
    Archives,
    /// `backup_<ts>.log` / `restore_<ts>.log`, aged by mtime.
    Logs,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("cannot read {dir}: {source}")]
    ReadDir {
        dir: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    /// `(file name, error)` for entries that could not be inspected or removed.
    pub failures: Vec<(String, String)>,
}

impl SweepReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Deletes artifacts in `dir` older than `max_age_days`.
///
/// An artifact exactly `max_age_days` old is kept; only strictly older ones
/// go. `max_age_days <= 0` disables the sweep.
pub fn sweep(dir: &Path, max_age_days: i64, target: SweepTarget) -> Result<SweepReport, SweepError> {
    sweep_at(dir, max_age_days, target, Utc::now())
}

pub fn sweep_at(
    dir: &Path,
    max_age_days: i64,
    target: SweepTarget,
    now: DateTime<Utc>,
) -> Result<SweepReport, SweepError> {
    let mut report = SweepReport::default();
    if max_age_days <= 0 {
        return Ok(report);
    }
    let cutoff = now - Duration::days(max_age_days);

    let read_dir = fs::read_dir(dir).map_err(|source| SweepError::ReadDir {
        dir: dir.display().to_string(),
        source,
    })?;

    for entry in read_dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.failures.push((String::new(), e.to_string()));
                continue;
            }
        };
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with(TEMP_PREFIX) {
            continue;
        }

        let aged = match target {
            SweepTarget::Archives => match ArchiveName::parse(&name) {
                Ok(parsed) => Ok(parsed.created_at()),
                Err(_) => continue,
            },
            SweepTarget::Logs => {
                if LogFileName::parse(&name).is_err() {
                    continue;
                }
                modified_at(&entry)
            }
        };

        let stamp = match aged {
            Ok(stamp) => stamp,
            Err(e) => {
                warn!(file = %name, error = %e, "cannot determine artifact age");
                report.failures.push((name, e.to_string()));
                continue;
            }
        };
        if stamp >= cutoff {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => report.deleted.push(name),
            Err(e) => {
                warn!(file = %name, error = %e, "cannot delete expired artifact");
                report.failures.push((name, e.to_string()));
            }
        }
    }

    report.deleted.sort();
    Ok(report)
}

fn modified_at(entry: &fs::DirEntry) -> io::Result<DateTime<Utc>> {
    let modified = entry.metadata()?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}
