//! Storage facade.
//!
//! Every component depends on the [`Storage`] trait only. Two structs
//! implement it:
//!
//! - [`LocalStore`]: embedded SQLite with an FTS5 index over chunks
//! - [`RemoteStore`]: retry/fallback envelope around a shared delegate, either
//!   an [`HttpStore`] or a second `LocalStore` on a shared filesystem path
//!
//! [`create_storage_backend`] picks one from configuration.

mod local;
mod remote;

#[cfg(feature = "http")]
mod http;

#[cfg(test)]
pub(crate) mod testing;

pub use local::LocalStore;
pub use remote::{RemoteStore, RetryPolicy};
pub(crate) use remote::wait_cancelled;

#[cfg(feature = "http")]
pub use http::HttpStore;

use crate::config::{AgentRecallConfig, StorageBackendKind};
use crate::error::{Error, Result};
use crate::models::{
    BackgroundSyncStatus, Chunk, LogEntry, RecentSourceSession, Scope, SemanticLabel, Session,
    SessionCheckpoint, SessionStatus, StorageStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// File name of the SQLite database used inside a shared directory.
pub const SHARED_DB_FILENAME: &str = "shared.db";

/// Selects which processed-session markers or checkpoints to clear.
///
/// `source_session_id` wins over `source`; with neither set everything in the
/// scope is cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearFilter {
    pub source: Option<String>,
    pub source_session_id: Option<String>,
}

impl ClearFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            source_session_id: None,
        }
    }

    pub fn session(source_session_id: impl Into<String>) -> Self {
        Self {
            source: None,
            source_session_id: Some(source_session_id.into()),
        }
    }

    /// SQL LIKE pattern for a source filter: `claude_code` -> `claude-code-%`.
    pub fn source_pattern(&self) -> Option<String> {
        self.source.as_deref().map(|source| {
            let normalized = source.trim().to_lowercase().replace('_', "-");
            format!("{normalized}-%")
        })
    }
}

/// Capability interface every backend implements. All operations are scoped
/// by the backend's tenant/project pair.
#[async_trait]
pub trait Storage: Send + Sync {
    fn scope(&self) -> &Scope;

    // Sessions
    async fn create_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>>;
    async fn get_active_session(&self) -> Result<Option<Session>>;
    async fn list_sessions(&self, limit: usize, status: Option<SessionStatus>)
    -> Result<Vec<Session>>;
    async fn update_session(&self, session: &Session) -> Result<()>;

    // Log entries
    async fn append_entry(&self, entry: &LogEntry) -> Result<()>;
    async fn get_entries(&self, session_id: Uuid) -> Result<Vec<LogEntry>>;
    async fn get_entries_by_label(
        &self,
        labels: &[SemanticLabel],
        limit: usize,
    ) -> Result<Vec<LogEntry>>;
    async fn count_log_entries(&self) -> Result<i64>;

    // Chunks
    /// Returns false when an equivalent chunk (same normalized content and
    /// label) already exists.
    async fn store_chunk(&self, chunk: &Chunk) -> Result<bool>;
    async fn has_chunk(&self, content: &str, label: SemanticLabel) -> Result<bool>;
    async fn count_chunks(&self) -> Result<i64>;
    /// Best matches first; ties broken by ascending id.
    async fn search_chunks_fts(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>>;
    async fn list_chunks_with_embeddings(&self) -> Result<Vec<Chunk>>;

    // Ingestion guards
    async fn is_session_processed(&self, source_session_id: &str) -> Result<bool>;
    async fn mark_session_processed(&self, source_session_id: &str) -> Result<()>;
    async fn clear_processed_sessions(&self, filter: &ClearFilter) -> Result<usize>;

    // Checkpoints
    async fn get_session_checkpoint(
        &self,
        source_session_id: &str,
    ) -> Result<Option<SessionCheckpoint>>;
    async fn save_session_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()>;
    async fn clear_session_checkpoints(&self, filter: &ClearFilter) -> Result<usize>;

    // Stats
    async fn get_stats(&self) -> Result<StorageStats>;
    async fn get_last_processed_at(&self) -> Result<Option<DateTime<Utc>>>;
    async fn list_recent_source_sessions(&self, limit: usize)
    -> Result<Vec<RecentSourceSession>>;

    // Background sync status
    /// Returns a fresh not-running record when none has been saved.
    async fn get_background_sync_status(&self) -> Result<BackgroundSyncStatus>;
    async fn save_background_sync_status(&self, status: &BackgroundSyncStatus) -> Result<()>;

    async fn start_background_sync(&self, pid: u32) -> Result<BackgroundSyncStatus> {
        let mut status = self.get_background_sync_status().await?;
        status.is_running = true;
        status.pid = Some(pid);
        status.started_at = Some(Utc::now());
        status.error_message = None;
        status.updated_at = Utc::now();
        self.save_background_sync_status(&status).await?;
        Ok(status)
    }

    async fn complete_background_sync(
        &self,
        sessions_processed: i64,
        learnings_extracted: i64,
        error_message: Option<String>,
    ) -> Result<BackgroundSyncStatus> {
        let mut status = self.get_background_sync_status().await?;
        status.is_running = false;
        status.completed_at = Some(Utc::now());
        status.sessions_processed = sessions_processed;
        status.learnings_extracted = learnings_extracted;
        status.error_message = error_message;
        status.pid = None;
        status.updated_at = Utc::now();
        self.save_background_sync_status(&status).await?;
        Ok(status)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Where a shared `base_url` points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedTarget {
    /// Directory holding a shared SQLite database
    Directory(PathBuf),
    /// HTTP storage service
    Http(String),
}

impl SharedTarget {
    pub fn parse(base_url: &str) -> Result<Self> {
        let trimmed = base_url.trim();
        if let Some(path) = trimmed
            .strip_prefix("file://")
            .or_else(|| trimmed.strip_prefix("sqlite://"))
        {
            if path.is_empty() {
                return Err(Error::validation("shared storage path must not be empty"));
            }
            return Ok(Self::Directory(PathBuf::from(path)));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(Self::Http(trimmed.trim_end_matches('/').to_string()));
        }
        Err(Error::validation(format!(
            "unsupported shared storage url: {trimmed} (expected http(s)://, file:// or sqlite://)"
        )))
    }
}

/// Build the configured storage backend.
///
/// `local_db_path` is the per-repository database; it backs the local backend
/// and serves as the fallback for the shared one.
pub fn create_storage_backend(
    config: &AgentRecallConfig,
    local_db_path: &Path,
) -> Result<Arc<dyn Storage>> {
    let storage = &config.storage;
    let shared = &storage.shared;

    match storage.backend {
        StorageBackendKind::Local => {
            let store = LocalStore::open(local_db_path, shared.scope())?
                .with_strict_namespace(storage.strict_namespace_validation);
            Ok(Arc::new(store))
        }
        StorageBackendKind::Shared => {
            let scope = shared.scope();
            scope.validate_shared_namespace()?;

            let base_url = shared
                .base_url
                .as_deref()
                .ok_or_else(|| Error::validation("storage.shared.base_url is required"))?;

            let delegate: Arc<dyn Storage> = match SharedTarget::parse(base_url)? {
                SharedTarget::Directory(dir) => {
                    std::fs::create_dir_all(&dir)?;
                    info!(path = %dir.display(), "Using shared directory storage");
                    Arc::new(
                        LocalStore::open(&dir.join(SHARED_DB_FILENAME), scope.clone())?
                            .with_strict_namespace(true),
                    )
                }
                #[cfg(feature = "http")]
                SharedTarget::Http(url) => {
                    info!(url = %url, "Using HTTP shared storage");
                    Arc::new(HttpStore::new(&url, scope.clone(), shared)?)
                }
                #[cfg(not(feature = "http"))]
                SharedTarget::Http(_) => {
                    return Err(Error::validation(
                        "HTTP shared storage requires the `http` feature",
                    ));
                }
            };

            let mut remote = RemoteStore::new(delegate, RetryPolicy::from_config(shared));
            if shared.local_fallback {
                let fallback = LocalStore::open(local_db_path, scope)?;
                remote = remote.with_fallback(Arc::new(fallback));
            }
            Ok(Arc::new(remote))
        }
    }
}
