use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A compose project managed as one backup unit.
///
/// `running` is an observation taken when the stack was listed; the engine
/// never owns the stack's lifecycle and re-checks before acting on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    pub path: PathBuf,
    pub skip_stop: bool,
    pub running: bool,
}
