pub mod config;
pub mod engine;
pub mod lock;
pub mod log_sink;
pub mod restore;
pub mod server;

pub use engine::{Engine, EnginePhase, EngineSettings, EngineStatus, RunHandle, TriggerError};
pub use lock::{EngineLock, LockGuard};
pub use log_sink::{LogFileEntry, LogFileError, LogSink, LOG_BUFFER_CAPACITY};
pub use restore::RestoreRequest;
pub use server::{build_router, AppState};
