//! Run trail: a bounded in-memory window plus one durable file per run.
//!
//! Both destinations sit behind the same mutex, so a reader never observes a
//! line in one sink but not the other once `append` has returned. Every
//! line is also mirrored to `tracing` for the process console.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stack_backup_core::{LogFileName, LogLevel, LogLine, NameError, RunKind};
use thiserror::Error;
use tracing::{error, info, warn};

pub const LOG_BUFFER_CAPACITY: usize = 500;

pub struct LogSink {
    log_dir: PathBuf,
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    ring: VecDeque<LogLine>,
    run_file: Option<File>,
}

impl LogSink {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            state: Mutex::new(SinkState::default()),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the durable file for a run. The file is closed when the returned
    /// guard is dropped. If it cannot be opened the run still logs to memory.
    pub fn begin_run(&self, kind: RunKind, started_at: DateTime<Utc>) -> RunLog<'_> {
        let name = LogFileName::new(kind, started_at).file_name();
        let path = self.log_dir.join(&name);
        let opened = fs::create_dir_all(&self.log_dir).and_then(|_| {
            OpenOptions::new().create(true).append(true).open(&path)
        });

        match opened {
            Ok(file) => {
                self.state().run_file = Some(file);
                RunLog {
                    sink: self,
                    file_name: Some(name),
                }
            }
            Err(e) => {
                self.append(
                    LogLevel::Warning,
                    format!("cannot open run log {}: {e}; logging to memory only", path.display()),
                );
                RunLog {
                    sink: self,
                    file_name: None,
                }
            }
        }
    }

    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        let line = LogLine::new(level, message);
        match level {
            LogLevel::Error => error!("{}", line.message),
            LogLevel::Warning => warn!("{}", line.message),
            LogLevel::Info | LogLevel::Success => info!("{}", line.message),
        }

        let mut state = self.state();
        if state.ring.len() == LOG_BUFFER_CAPACITY {
            state.ring.pop_front();
        }
        state.ring.push_back(line.clone());

        if let Some(file) = state.run_file.as_mut() {
            let written = writeln!(file, "{line}").and_then(|_| file.flush());
            if let Err(e) = written {
                error!(error = %e, "failed to write run log line");
            }
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.append(LogLevel::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogLevel::Error, message);
    }

    /// The most recent `n` lines (clamped to `1..=500`), oldest first.
    pub fn snapshot(&self, n: usize) -> Vec<LogLine> {
        let n = n.clamp(1, LOG_BUFFER_CAPACITY);
        let state = self.state();
        let skip = state.ring.len().saturating_sub(n);
        state.ring.iter().skip(skip).cloned().collect()
    }

    fn close_run(&self) {
        if let Some(file) = self.state().run_file.take() {
            if let Err(e) = file.sync_all() {
                warn!(error = %e, "failed to sync run log");
            }
        }
    }

    pub fn list_log_files(&self) -> io::Result<Vec<LogFileEntry>> {
        let mut out = Vec::new();
        let read_dir = match fs::read_dir(&self.log_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        for entry in read_dir {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Ok(parsed) = LogFileName::parse(&name) else {
                continue;
            };
            let meta = entry.metadata()?;
            out.push(LogFileEntry {
                name,
                kind: parsed.kind(),
                size: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from).ok(),
            });
        }
        out.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(out)
    }

    pub fn read_log_file(&self, name: &str) -> Result<String, LogFileError> {
        let parsed = LogFileName::parse(name)?;
        let path = self.log_dir.join(parsed.file_name());
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LogFileError::NotFound(name.to_owned()),
            _ => LogFileError::Io(e),
        })
    }
}

/// Keeps the run's durable file open; closes it on drop.
pub struct RunLog<'a> {
    sink: &'a LogSink,
    file_name: Option<String>,
}

impl RunLog<'_> {
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }
}

impl Drop for RunLog<'_> {
    fn drop(&mut self) {
        self.sink.close_run();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogFileEntry {
    pub name: String,
    pub kind: RunKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum LogFileError {
    #[error(transparent)]
    InvalidName(#[from] NameError),
    #[error("log file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
