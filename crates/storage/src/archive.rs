use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use stack_backup_core::{ArchiveName, ArchiveSummary, HashingWriter, NameError, Stack};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Compose configuration picked up from the stack root, in this order.
pub const COMPOSE_FILES: &[&str] = &[
    "compose.yml",
    "compose.yaml",
    "docker-compose.yml",
    "docker-compose.yaml",
    ".env",
];

/// Prefix of in-progress archives; never listed, swept or restored.
pub const TEMP_PREFIX: &str = ".tmp_";

const EXCLUDED_NAMES: &[&str] = &[".git"];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("stack directory not found: {0}")]
    MissingStackDir(PathBuf),
    #[error("no compose file found in {0}")]
    NoComposeFile(PathBuf),
    #[error("link {link} resolves outside the stack directory ({target})")]
    LinkEscapes { link: PathBuf, target: PathBuf },
    #[error("cannot resolve link {0}")]
    UnresolvableLink(PathBuf),
    #[error("archive build exceeded its time limit")]
    TimedOut,
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> ArchiveError {
    let context = context.into();
    move |source| ArchiveError::Io { context, source }
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub include_data: bool,
    pub created_at: DateTime<Utc>,
    /// Checked between entries; once passed the build fails with `TimedOut`.
    pub deadline: Option<Instant>,
}

impl ArchiveOptions {
    pub fn new(include_data: bool) -> Self {
        Self {
            include_data,
            created_at: Utc::now(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn check_deadline(&self) -> Result<(), ArchiveError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ArchiveError::TimedOut),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub name: ArchiveName,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub entries: usize,
}

impl ArchiveInfo {
    pub fn summary(&self) -> ArchiveSummary {
        ArchiveSummary {
            filename: self.name.file_name(),
            size: self.size,
            created_at: self.name.created_at(),
            sha256: self.sha256.clone(),
        }
    }
}

/// Packages a stack into `<output_dir>/<stack>_<timestamp>.tar.gz`.
///
/// The archive is streamed to a `.tmp_` sibling and renamed into place only
/// once complete; on any failure the temporary file is removed, so a
/// finished name always refers to a whole archive.
pub fn build_archive(
    stack: &Stack,
    output_dir: &Path,
    options: &ArchiveOptions,
) -> Result<ArchiveInfo, ArchiveError> {
    if !stack.path.is_dir() {
        return Err(ArchiveError::MissingStackDir(stack.path.clone()));
    }
    let root = fs::canonicalize(&stack.path)
        .map_err(io_err(format!("resolve stack dir {}", stack.path.display())))?;
    fs::create_dir_all(output_dir)
        .map_err(io_err(format!("create backup dir {}", output_dir.display())))?;

    let mut name = ArchiveName::new(&stack.name, options.created_at)?;
    while output_dir.join(name.file_name()).exists() {
        name = name.bumped(1);
    }
    let final_path = output_dir.join(name.file_name());
    let tmp_path = output_dir.join(format!("{TEMP_PREFIX}{}", name.file_name()));

    let written = write_archive(&root, output_dir, &tmp_path, options).and_then(|written| {
        fs::rename(&tmp_path, &final_path)
            .map_err(io_err(format!("rename into {}", final_path.display())))?;
        Ok(written)
    });

    let (sha256, entries) = match written {
        Ok(written) => written,
        Err(e) => {
            if let Err(rm) = fs::remove_file(&tmp_path) {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!(path = %tmp_path.display(), error = %rm, "could not remove partial archive");
                }
            }
            return Err(e);
        }
    };

    let size = fs::metadata(&final_path)
        .map_err(io_err(format!("stat {}", final_path.display())))?
        .len();

    Ok(ArchiveInfo {
        name,
        path: final_path,
        size,
        sha256,
        entries,
    })
}

fn write_archive(
    root: &Path,
    output_dir: &Path,
    tmp_path: &Path,
    options: &ArchiveOptions,
) -> Result<(String, usize), ArchiveError> {
    let file = File::create(tmp_path).map_err(io_err(format!("create {}", tmp_path.display())))?;
    let encoder = GzEncoder::new(
        HashingWriter::new(BufWriter::new(file)),
        Compression::default(),
    );
    let mut builder = tar::Builder::new(encoder);
    let mut entries = 0;

    let mut has_definition = false;
    for name in COMPOSE_FILES {
        let path = root.join(name);
        if fs::symlink_metadata(&path).is_err() {
            continue;
        }
        options.check_deadline()?;
        if append_member(&mut builder, root, &path, Path::new(name), options)? {
            entries += 1;
            has_definition |= *name != ".env";
        }
    }
    if !has_definition {
        return Err(ArchiveError::NoComposeFile(root.to_path_buf()));
    }

    if options.include_data {
        // the backup dir may live inside the stack; never archive ourselves
        let own_dir = fs::canonicalize(output_dir).ok();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let excluded = e
                    .file_name()
                    .to_str()
                    .is_some_and(|n| EXCLUDED_NAMES.contains(&n));
                !excluded && own_dir.as_deref() != Some(e.path())
            });

        for entry in walker {
            options.check_deadline()?;
            let entry = entry.map_err(|e| ArchiveError::Io {
                context: format!("walk {}", root.display()),
                source: e.into(),
            })?;
            let rel = entry.path().strip_prefix(root).map_err(|_| ArchiveError::Io {
                context: format!("walk {}", root.display()),
                source: io::Error::other("entry outside stack root"),
            })?;
            if entry.depth() == 1 && rel.to_str().is_some_and(|n| COMPOSE_FILES.contains(&n)) {
                continue;
            }
            if append_member(&mut builder, root, entry.path(), rel, options)? {
                entries += 1;
            }
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(io_err("finish tar stream"))?;
    let hashing = encoder.finish().map_err(io_err("finish gzip stream"))?;
    let (mut buffered, sha256) = hashing.finish();
    buffered.flush().map_err(io_err("flush archive"))?;
    let file = buffered
        .into_inner()
        .map_err(|e| ArchiveError::Io {
            context: "flush archive".into(),
            source: e.into_error(),
        })?;
    file.sync_all().map_err(io_err("sync archive"))?;

    Ok((sha256, entries))
}

/// Adds one filesystem entry under `rel`. Returns `false` when the entry is
/// skipped by policy (special files, links to directories).
fn append_member<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    path: &Path,
    rel: &Path,
    options: &ArchiveOptions,
) -> Result<bool, ArchiveError> {
    let meta = fs::symlink_metadata(path).map_err(io_err(format!("stat {}", path.display())))?;
    let file_type = meta.file_type();

    if file_type.is_dir() {
        builder
            .append_dir(rel, path)
            .map_err(io_err(format!("append dir {}", rel.display())))?;
        return Ok(true);
    }

    let source = if file_type.is_file() {
        path.to_path_buf()
    } else if file_type.is_symlink() {
        let target =
            fs::canonicalize(path).map_err(|_| ArchiveError::UnresolvableLink(path.to_path_buf()))?;
        if !target.starts_with(root) {
            return Err(ArchiveError::LinkEscapes {
                link: path.to_path_buf(),
                target,
            });
        }
        if !target.is_file() {
            debug!(link = %path.display(), "skipping link to directory");
            return Ok(false);
        }
        target
    } else {
        debug!(path = %path.display(), "skipping special file");
        return Ok(false);
    };

    // the header size comes from the open handle; the body is held to it
    let file = File::open(&source).map_err(io_err(format!("open {}", source.display())))?;
    let meta = file
        .metadata()
        .map_err(io_err(format!("stat {}", source.display())))?;
    let mut header = tar::Header::new_gnu();
    header.set_metadata(&meta);
    header.set_size(meta.len());

    let body = SizedEntry::new(file, meta.len(), options.deadline);
    builder.append_data(&mut header, rel, body).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut {
            ArchiveError::TimedOut
        } else {
            ArchiveError::Io {
                context: format!("append {}", rel.display()),
                source: e,
            }
        }
    })?;
    Ok(true)
}

/// Reads exactly `size` bytes of a file that may be changing underneath.
///
/// Growth past `size` is cut off; a file that shrinks fails with
/// `UnexpectedEof` instead of producing a short tar member.
struct SizedEntry<R> {
    inner: io::Take<R>,
    remaining: u64,
    deadline: Option<Instant>,
}

impl<R: Read> SizedEntry<R> {
    fn new(inner: R, size: u64, deadline: Option<Instant>) -> Self {
        Self {
            inner: inner.take(size),
            remaining: size,
            deadline,
        }
    }
}

impl<R: Read> Read for SizedEntry<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "archive deadline passed"));
        }
        let n = self.inner.read(buf)?;
        if n == 0 && self.remaining > 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving; {} byte(s) missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// A finished archive found in the backup directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub filename: String,
    pub stack: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Lists archives whose names follow the archive grammar, newest first.
pub fn list_archives(dir: &Path) -> io::Result<Vec<ArchiveEntry>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(filename) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(name) = ArchiveName::parse(&filename) else {
            continue;
        };
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        out.push(ArchiveEntry {
            filename,
            stack: name.stack().to_owned(),
            size: meta.len(),
            created_at: name.created_at(),
        });
    }
    out.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use stack_backup_core::content_hash;
    use std::io::Read;

    fn stack_at(dir: &Path, name: &str) -> Stack {
        Stack {
            name: name.to_owned(),
            path: dir.to_path_buf(),
            skip_stop: false,
            running: false,
        }
    }

    fn seed_stack(dir: &Path) {
        fs::write(dir.join("compose.yml"), "services:\n  web:\n    image: nginx\n").expect("compose");
        fs::write(dir.join(".env"), "TAG=1\n").expect("env");
        fs::create_dir_all(dir.join("data/db")).expect("data dir");
        fs::write(dir.join("data/db/state.bin"), [1u8, 2, 3]).expect("data file");
        fs::create_dir_all(dir.join(".git")).expect("git dir");
        fs::write(dir.join(".git/HEAD"), "ref").expect("git head");
    }

    fn members(path: &Path) -> Vec<String> {
        let file = File::open(path).expect("open archive");
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .expect("entries")
            .map(|e| {
                e.expect("entry")
                    .path()
                    .expect("path")
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_owned()
            })
            .collect()
    }

    fn read_member(path: &Path, wanted: &str) -> Vec<u8> {
        let file = File::open(path).expect("open archive");
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        for entry in archive.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            if entry.path().expect("path").to_string_lossy() == wanted {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).expect("read");
                return buf;
            }
        }
        panic!("{wanted} not in archive");
    }

    #[test]
    fn builds_config_and_data_without_git() {
        let stack_dir = tempfile::tempdir().expect("stack");
        let out = tempfile::tempdir().expect("out");
        seed_stack(stack_dir.path());

        let info = build_archive(
            &stack_at(stack_dir.path(), "web"),
            out.path(),
            &ArchiveOptions::new(true),
        )
        .expect("build");

        assert!(info.path.exists());
        assert_eq!(info.name.stack(), "web");
        let names = members(&info.path);
        assert_eq!(&names[..2], &["compose.yml", ".env"]);
        assert!(names.contains(&"data/db/state.bin".to_owned()));
        assert!(!names.iter().any(|n| n.starts_with(".git")));
        assert_eq!(names.iter().filter(|n| *n == "compose.yml").count(), 1);
        assert_eq!(info.entries, names.len());

        let bytes = fs::read(&info.path).expect("read archive");
        assert_eq!(info.sha256, content_hash(&bytes));
        assert_eq!(info.size, bytes.len() as u64);
    }

    #[test]
    fn config_only_when_data_excluded() {
        let stack_dir = tempfile::tempdir().expect("stack");
        let out = tempfile::tempdir().expect("out");
        seed_stack(stack_dir.path());

        let info = build_archive(
            &stack_at(stack_dir.path(), "web"),
            out.path(),
            &ArchiveOptions::new(false),
        )
        .expect("build");

        assert_eq!(members(&info.path), vec!["compose.yml", ".env"]);
        assert_eq!(
            read_member(&info.path, "compose.yml"),
            b"services:\n  web:\n    image: nginx\n"
        );
    }

    #[test]
    fn missing_compose_file_leaves_no_artifact() {
        let stack_dir = tempfile::tempdir().expect("stack");
        let out = tempfile::tempdir().expect("out");
        fs::write(stack_dir.path().join(".env"), "X=1").expect("env");

        let err = build_archive(
            &stack_at(stack_dir.path(), "web"),
            out.path(),
            &ArchiveOptions::new(true),
        )
        .unwrap_err();

        assert!(matches!(err, ArchiveError::NoComposeFile(_)));
        assert_eq!(fs::read_dir(out.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn missing_stack_dir_is_reported() {
        let out = tempfile::tempdir().expect("out");
        let err = build_archive(
            &stack_at(&out.path().join("nope"), "nope"),
            out.path(),
            &ArchiveOptions::new(true),
        )
        .unwrap_err();
        assert!(matches!(err, ArchiveError::MissingStackDir(_)));
    }

    #[test]
    fn expired_deadline_fails_and_cleans_up() {
        let stack_dir = tempfile::tempdir().expect("stack");
        let out = tempfile::tempdir().expect("out");
        seed_stack(stack_dir.path());

        let options = ArchiveOptions::new(true).with_deadline(Instant::now());
        let err = build_archive(&stack_at(stack_dir.path(), "web"), out.path(), &options).unwrap_err();

        assert!(matches!(err, ArchiveError::TimedOut));
        assert_eq!(fs::read_dir(out.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn same_second_builds_get_distinct_names() {
        let stack_dir = tempfile::tempdir().expect("stack");
        let out = tempfile::tempdir().expect("out");
        seed_stack(stack_dir.path());
        let stack = stack_at(stack_dir.path(), "web");
        let options = ArchiveOptions::new(false);

        let first = build_archive(&stack, out.path(), &options).expect("first");
        let second = build_archive(&stack, out.path(), &options).expect("second");

        assert_ne!(first.name.file_name(), second.name.file_name());
        assert_eq!(second.name.created_at() - first.name.created_at(), chrono::Duration::seconds(1));
    }

    #[cfg(unix)]
    #[test]
    fn link_inside_stack_is_stored_as_file() {
        let stack_dir = tempfile::tempdir().expect("stack");
        let out = tempfile::tempdir().expect("out");
        seed_stack(stack_dir.path());
        std::os::unix::fs::symlink(
            stack_dir.path().join("data/db/state.bin"),
            stack_dir.path().join("data/current"),
        )
        .expect("symlink");

        let info = build_archive(
            &stack_at(stack_dir.path(), "web"),
            out.path(),
            &ArchiveOptions::new(true),
        )
        .expect("build");

        assert_eq!(read_member(&info.path, "data/current"), vec![1u8, 2, 3]);
    }

    #[cfg(unix)]
    #[test]
    fn link_escaping_stack_fails_without_artifact() {
        let stack_dir = tempfile::tempdir().expect("stack");
        let outside = tempfile::tempdir().expect("outside");
        let out = tempfile::tempdir().expect("out");
        seed_stack(stack_dir.path());
        fs::write(outside.path().join("secret"), "x").expect("secret");
        std::os::unix::fs::symlink(
            outside.path().join("secret"),
            stack_dir.path().join("data/secret"),
        )
        .expect("symlink");

        let err = build_archive(
            &stack_at(stack_dir.path(), "web"),
            out.path(),
            &ArchiveOptions::new(true),
        )
        .unwrap_err();

        assert!(matches!(err, ArchiveError::LinkEscapes { .. }));
        assert_eq!(fs::read_dir(out.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn shrinking_file_fails_the_entry() {
        let dir = tempfile::tempdir().expect("dir");
        let path = dir.path().join("a.log");
        fs::write(&path, vec![b'x'; 4096]).expect("write");
        let file = File::open(&path).expect("open");
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_len(1000))
            .expect("shrink");

        let mut body = SizedEntry::new(file, 4096, None);
        let err = io::copy(&mut body, &mut io::sink()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn growing_file_is_cut_at_opened_size() {
        let dir = tempfile::tempdir().expect("dir");
        let path = dir.path().join("a.log");
        fs::write(&path, vec![b'x'; 1000]).expect("write");
        let file = File::open(&path).expect("open");
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(&[b'y'; 500]))
            .expect("grow");

        let mut body = SizedEntry::new(file, 1000, None);
        let mut copied = Vec::new();
        body.read_to_end(&mut copied).expect("read");
        assert_eq!(copied, vec![b'x'; 1000]);
    }

    #[test]
    fn passed_deadline_interrupts_a_file_copy() {
        let dir = tempfile::tempdir().expect("dir");
        let path = dir.path().join("a.log");
        fs::write(&path, vec![b'x'; 1000]).expect("write");
        let file = File::open(&path).expect("open");

        let mut body = SizedEntry::new(file, 1000, Some(Instant::now()));
        let err = io::copy(&mut body, &mut io::sink()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn file_written_during_build_yields_a_readable_archive() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let stack_dir = tempfile::tempdir().expect("stack");
        let out = tempfile::tempdir().expect("out");
        seed_stack(stack_dir.path());
        let log = stack_dir.path().join("data/a.log");
        fs::write(&log, vec![b'x'; 8 * 1024 * 1024]).expect("log");
        fs::write(stack_dir.path().join("data/z.txt"), "last").expect("z");

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let stop = Arc::clone(&stop);
            let log = log.clone();
            std::thread::spawn(move || {
                let mut f = fs::OpenOptions::new().append(true).open(&log).expect("append");
                for _ in 0..512 {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    f.write_all(&[b'y'; 64 * 1024]).expect("grow");
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            })
        };

        let built = build_archive(
            &stack_at(stack_dir.path(), "web"),
            out.path(),
            &ArchiveOptions::new(true),
        );
        stop.store(true, Ordering::Relaxed);
        writer.join().expect("writer");

        let info = built.expect("build");
        let target = tempfile::tempdir().expect("target");
        crate::restore::extract_archive(&info.path, target.path()).expect("extract");
        assert_eq!(fs::read(target.path().join("data/z.txt")).expect("z"), b"last");
        let restored = fs::read(target.path().join("data/a.log")).expect("a.log");
        assert!(restored.len() >= 8 * 1024 * 1024);
        assert!(restored[..8 * 1024 * 1024].iter().all(|b| *b == b'x'));
    }

    #[test]
    fn listing_skips_temp_and_foreign_files() {
        let out = tempfile::tempdir().expect("out");
        fs::write(out.path().join("web_2026-02-13_01-00-00.tar.gz"), "a").expect("a");
        fs::write(out.path().join("db_2026-02-14_01-00-00.tar.gz"), "bb").expect("b");
        fs::write(out.path().join(".tmp_web_2026-02-15_01-00-00.tar.gz"), "c").expect("c");
        fs::write(out.path().join("notes.txt"), "d").expect("d");

        let listed = list_archives(out.path()).expect("list");
        let names: Vec<_> = listed.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(
            names,
            vec!["db_2026-02-14_01-00-00.tar.gz", "web_2026-02-13_01-00-00.tar.gz"]
        );
        assert_eq!(listed[0].stack, "db");
        assert_eq!(listed[0].size, 2);
    }
}
