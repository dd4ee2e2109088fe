pub mod archive;
pub mod restore;
pub mod retention;

pub use archive::{
    build_archive, list_archives, ArchiveEntry, ArchiveError, ArchiveInfo, ArchiveOptions,
    COMPOSE_FILES, TEMP_PREFIX,
};
pub use restore::{extract_archive, resolve_archive, ExtractReport, RestoreError};
pub use retention::{sweep, sweep_at, SweepError, SweepReport, SweepTarget};
