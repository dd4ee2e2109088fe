use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use stack_backup_core::{ArchiveName, NameError};
use tar::EntryType;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    InvalidArchiveName(#[from] NameError),
    #[error("archive {archive} belongs to stack {archive_stack}, not {requested}")]
    StackMismatch {
        archive: String,
        archive_stack: String,
        requested: String,
    },
    #[error("archive not found: {0}")]
    ArchiveNotFound(String),
    #[error("archive {0} resolves outside the backup directory")]
    OutsideBackupDir(String),
    #[error("archive member {0:?} would be written outside the target directory")]
    UnsafeMember(String),
    #[error("archive member {member:?} has unsupported type {kind:?}")]
    UnsupportedMember { member: String, kind: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> RestoreError {
    let context = context.into();
    move |source| RestoreError::Io { context, source }
}

/// Resolves a client-supplied archive name to a file in `backup_dir`.
///
/// The name must follow the archive grammar (which already excludes path
/// separators), must belong to `stack` unless `allow_cross_stack` is set, and
/// its canonical path must stay inside the backup directory.
pub fn resolve_archive(
    backup_dir: &Path,
    archive: &str,
    stack: &str,
    allow_cross_stack: bool,
) -> Result<(ArchiveName, PathBuf), RestoreError> {
    let name = ArchiveName::parse(archive)?;
    if name.stack() != stack && !allow_cross_stack {
        return Err(RestoreError::StackMismatch {
            archive: archive.to_owned(),
            archive_stack: name.stack().to_owned(),
            requested: stack.to_owned(),
        });
    }

    let candidate = backup_dir.join(name.file_name());
    if !candidate.is_file() {
        return Err(RestoreError::ArchiveNotFound(archive.to_owned()));
    }
    let root = fs::canonicalize(backup_dir)
        .map_err(io_err(format!("resolve backup dir {}", backup_dir.display())))?;
    let resolved =
        fs::canonicalize(&candidate).map_err(io_err(format!("resolve {}", candidate.display())))?;
    if !resolved.starts_with(&root) {
        return Err(RestoreError::OutsideBackupDir(archive.to_owned()));
    }
    Ok((name, resolved))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub files: usize,
    pub directories: usize,
}

/// Extracts `archive` over `target_dir`.
///
/// Every member is checked in a first pass before anything is written: only
/// regular files and directories with relative, `..`-free paths are accepted.
/// Existing files are overwritten. There is no rollback if the second pass
/// fails part way.
pub fn extract_archive(archive: &Path, target_dir: &Path) -> Result<ExtractReport, RestoreError> {
    let report = validate_members(archive)?;

    fs::create_dir_all(target_dir)
        .map_err(io_err(format!("create {}", target_dir.display())))?;
    let file = File::open(archive).map_err(io_err(format!("open {}", archive.display())))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_overwrite(true);
    tar.set_preserve_permissions(true);

    for entry in tar.entries().map_err(io_err("read archive"))? {
        let mut entry = entry.map_err(io_err("read archive entry"))?;
        let member = entry.path().map_err(io_err("read member path"))?.display().to_string();
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(io_err(format!("unpack {member}")))?;
        if !unpacked {
            return Err(RestoreError::UnsafeMember(member));
        }
        debug!(member = %member, "restored");
    }

    Ok(report)
}

fn validate_members(archive: &Path) -> Result<ExtractReport, RestoreError> {
    let file = File::open(archive).map_err(io_err(format!("open {}", archive.display())))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut report = ExtractReport::default();

    for entry in tar.entries().map_err(io_err("read archive"))? {
        let entry = entry.map_err(io_err("read archive entry"))?;
        let path = entry.path().map_err(io_err("read member path"))?;
        let member = path.display().to_string();

        if !is_contained(&path) {
            return Err(RestoreError::UnsafeMember(member));
        }
        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => report.files += 1,
            EntryType::Directory => report.directories += 1,
            other => {
                return Err(RestoreError::UnsupportedMember {
                    member,
                    kind: format!("{other:?}"),
                })
            }
        }
    }
    Ok(report)
}

fn is_contained(path: &Path) -> bool {
    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    normal > 0
}
