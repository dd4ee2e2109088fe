pub mod hash;
pub mod log;
pub mod naming;
pub mod run;
pub mod stack;

pub use hash::{content_hash, HashingWriter};
pub use log::{LogLevel, LogLine};
pub use naming::{
    format_timestamp, parse_timestamp, validate_stack_name, ArchiveName, LogFileName, NameError,
    NAME_FORMAT_VERSION, TIMESTAMP_FORMAT,
};
pub use run::{
    ArchiveSummary, RunKind, RunOutcome, RunSummary, StackOutcome, StackPhase, StepFailure,
};
pub use stack::Stack;
