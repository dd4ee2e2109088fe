#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stack_backup_compose::{DirectoryCatalog, StackCatalog, StackController, StackError, StackOp};
use stack_backup_core::Stack;
use stack_backup_daemon::{Engine, EngineSettings, LogSink};
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// Records every stop/start and status check instead of talking to docker.
#[derive(Default)]
pub struct FakeController {
    calls: Mutex<Vec<String>>,
    status_checks: Mutex<usize>,
    running: Mutex<HashSet<String>>,
    fail_stop: HashSet<String>,
    panic_stop: HashSet<String>,
    fail_status: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    status_gate: Option<Arc<Semaphore>>,
}

impl FakeController {
    pub fn running(names: &[&str]) -> Self {
        Self {
            running: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn failing_stop(mut self, name: &str) -> Self {
        self.fail_stop.insert(name.to_owned());
        self
    }

    pub fn panicking_stop(mut self, name: &str) -> Self {
        self.panic_stop.insert(name.to_owned());
        self
    }

    pub fn failing_status(mut self, name: &str) -> Self {
        self.fail_status.insert(name.to_owned());
        self
    }

    /// Every stop waits for a permit on `gate` before completing.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Every status check waits for a permit on `gate`, like a docker
    /// daemon that has stopped answering.
    pub fn gated_status(mut self, gate: Arc<Semaphore>) -> Self {
        self.status_gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn status_checks(&self) -> usize {
        *self.status_checks.lock().unwrap()
    }
}

#[async_trait]
impl StackController for FakeController {
    async fn stop(&self, stack: &Stack) -> Result<(), StackError> {
        self.calls.lock().unwrap().push(format!("stop:{}", stack.name));
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if self.panic_stop.contains(&stack.name) {
            panic!("controller exploded on {}", stack.name);
        }
        if self.fail_stop.contains(&stack.name) {
            return Err(StackError::new(stack, StackOp::Stop, "exit status 1"));
        }
        self.running.lock().unwrap().remove(&stack.name);
        Ok(())
    }

    async fn start(&self, stack: &Stack) -> Result<(), StackError> {
        self.calls.lock().unwrap().push(format!("start:{}", stack.name));
        self.running.lock().unwrap().insert(stack.name.clone());
        Ok(())
    }

    async fn is_running(&self, stack: &Stack) -> Result<bool, StackError> {
        *self.status_checks.lock().unwrap() += 1;
        if let Some(gate) = &self.status_gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if self.fail_status.contains(&stack.name) {
            return Err(StackError::new(stack, StackOp::Status, "cannot connect to the docker daemon"));
        }
        Ok(self.running.lock().unwrap().contains(&stack.name))
    }
}

pub struct FixedCatalog {
    pub stacks: Vec<Stack>,
}

#[async_trait]
impl StackCatalog for FixedCatalog {
    async fn discover(&self) -> anyhow::Result<Vec<Stack>> {
        Ok(self
            .stacks
            .iter()
            .cloned()
            .map(|s| Stack { running: false, ..s })
            .collect())
    }

    async fn list_stacks(&self) -> anyhow::Result<Vec<Stack>> {
        Ok(self.stacks.clone())
    }
}

pub struct Fixture {
    pub tmp: TempDir,
    pub stacks_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub controller: Arc<FakeController>,
    pub engine: Engine,
}

impl Fixture {
    pub fn stack_path(&self, name: &str) -> PathBuf {
        self.stacks_dir.join(name)
    }

    pub fn archive_names(&self) -> Vec<String> {
        self.engine
            .list_archives()
            .unwrap()
            .into_iter()
            .map(|a| a.filename)
            .collect()
    }
}

/// Builds an engine over `stacks` (name, skip_stop), each with a compose file
/// and some data on disk.
pub fn fixture(stacks: &[(&str, bool)], controller: FakeController) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let stacks_dir = tmp.path().join("stacks");

    let stacks: Vec<Stack> = stacks
        .iter()
        .map(|(name, skip_stop)| {
            let path = stacks_dir.join(name);
            write_stack(&path, name);
            Stack {
                name: name.to_string(),
                path,
                skip_stop: *skip_stop,
                running: true,
            }
        })
        .collect();

    assemble(tmp, controller, |_| {
        let catalog: Arc<dyn StackCatalog> = Arc::new(FixedCatalog { stacks });
        catalog
    })
}

/// Like [`fixture`], but stacks are found by the real [`DirectoryCatalog`],
/// which asks `controller` for their state when listing.
pub fn directory_fixture(names: &[&str], controller: FakeController) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let stacks_dir = tmp.path().join("stacks");
    for name in names {
        write_stack(&stacks_dir.join(name), name);
    }

    assemble(tmp, controller, |controller| {
        let catalog: Arc<dyn StackCatalog> =
            Arc::new(DirectoryCatalog::new(&stacks_dir, Vec::new(), controller));
        catalog
    })
}

fn assemble(
    tmp: TempDir,
    controller: FakeController,
    catalog: impl FnOnce(Arc<dyn StackController>) -> Arc<dyn StackCatalog>,
) -> Fixture {
    let stacks_dir = tmp.path().join("stacks");
    let backup_dir = tmp.path().join("backups");
    let log_dir = tmp.path().join("logs");
    fs::create_dir_all(&backup_dir).unwrap();

    let controller = Arc::new(controller);
    let shared: Arc<dyn StackController> = controller.clone();
    let engine = Engine::new(
        EngineSettings {
            backup_dir: backup_dir.clone(),
            include_data: true,
            retention_days: 7,
            log_retention_days: 14,
            archive_timeout: Duration::from_secs(60),
        },
        controller.clone(),
        catalog(shared),
        LogSink::new(&log_dir),
    );

    Fixture {
        tmp,
        stacks_dir,
        backup_dir,
        log_dir,
        controller,
        engine,
    }
}

pub fn write_stack(path: &Path, name: &str) {
    fs::create_dir_all(path.join("data/nested")).unwrap();
    fs::write(
        path.join("compose.yml"),
        format!("services:\n  {name}:\n    image: {name}:latest\n"),
    )
    .unwrap();
    fs::write(path.join(".env"), "TZ=UTC\n").unwrap();
    fs::write(path.join("data/db.bin"), [0u8, 1, 2, 3, 255, 254]).unwrap();
    fs::write(path.join("data/nested/notes.txt"), format!("{name} notes\n")).unwrap();
}

/// Member names of a `.tar.gz` archive, in archive order.
pub fn archive_members(path: &Path) -> Vec<String> {
    let file = fs::File::open(path).unwrap();
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    tar.entries()
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            e.path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        })
        .collect()
}

/// Writes a gzip tar whose member names bypass the builder's path checks.
pub fn write_raw_archive(path: &Path, members: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        file,
        flate2::Compression::default(),
    ));
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        let raw = &mut header.as_old_mut().name;
        raw[..name.len()].copy_from_slice(name.as_bytes());
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}
