//! Session ingestion and background sync.
//!
//! - [`lock`]: cross-process file lock with PID liveness
//! - [`background`]: status tracking and one-at-a-time sync runs
//! - [`auto`]: discover sessions, extract learnings, persist and compact
//! - [`extract`]: LLM-backed transcript extraction

pub mod auto;
pub mod background;
pub mod extract;
pub mod lock;

pub use auto::{
    AutoSync, ListCounts, SessionDiagnostic, SessionListing, SessionOutcome, SessionRow,
    SourceCounts, SourceStatus, SyncReport, SyncRequest,
};
pub use background::{BackgroundSyncManager, BackgroundSyncResult, SyncRunner};
pub use extract::TranscriptExtractor;
pub use lock::{LOCK_FILENAME, SyncLock, process_exists};
