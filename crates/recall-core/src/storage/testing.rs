//! Test double that injects failures in front of a real store.

use super::{ClearFilter, LocalStore, Storage};
use crate::error::{Error, Result};
use crate::models::{
    BackgroundSyncStatus, Chunk, LogEntry, RecentSourceSession, Scope, SemanticLabel, Session,
    SessionCheckpoint, SessionStatus, StorageStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

const ALWAYS: u32 = u32::MAX;

pub(crate) struct FlakyStore {
    inner: LocalStore,
    failures: AtomicU32,
    calls: AtomicU32,
    error: fn() -> Error,
    operation: Option<&'static str>,
}

impl FlakyStore {
    pub(crate) fn new(inner: LocalStore) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            error: || Error::Timeout("injected".into()),
            operation: None,
        }
    }

    pub(crate) fn in_memory(scope: Scope) -> Self {
        Self::new(LocalStore::open_in_memory(scope).unwrap())
    }

    /// Fail the next `count` gated calls with `error`.
    pub(crate) fn failing(mut self, count: u32, error: fn() -> Error) -> Self {
        self.failures = AtomicU32::new(count);
        self.error = error;
        self
    }

    pub(crate) fn always_failing(self, error: fn() -> Error) -> Self {
        self.failing(ALWAYS, error)
    }

    /// Only gate the named operation.
    pub(crate) fn only(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self, operation: &str) -> Result<()> {
        if self.operation.is_some_and(|only| only != operation) {
            return Ok(());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        if remaining != ALWAYS {
            self.failures.fetch_sub(1, Ordering::SeqCst);
        }
        Err((self.error)())
    }
}

#[async_trait]
impl Storage for FlakyStore {
    fn scope(&self) -> &Scope {
        self.inner.scope()
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.gate("create_session")?;
        self.inner.create_session(session).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.gate("get_session")?;
        self.inner.get_session(id).await
    }

    async fn get_active_session(&self) -> Result<Option<Session>> {
        self.gate("get_active_session")?;
        self.inner.get_active_session().await
    }

    async fn list_sessions(
        &self,
        limit: usize,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>> {
        self.gate("list_sessions")?;
        self.inner.list_sessions(limit, status).await
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        self.gate("update_session")?;
        self.inner.update_session(session).await
    }

    async fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        self.gate("append_entry")?;
        self.inner.append_entry(entry).await
    }

    async fn get_entries(&self, session_id: Uuid) -> Result<Vec<LogEntry>> {
        self.gate("get_entries")?;
        self.inner.get_entries(session_id).await
    }

    async fn get_entries_by_label(
        &self,
        labels: &[SemanticLabel],
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        self.gate("get_entries_by_label")?;
        self.inner.get_entries_by_label(labels, limit).await
    }

    async fn count_log_entries(&self) -> Result<i64> {
        self.gate("count_log_entries")?;
        self.inner.count_log_entries().await
    }

    async fn store_chunk(&self, chunk: &Chunk) -> Result<bool> {
        self.gate("store_chunk")?;
        self.inner.store_chunk(chunk).await
    }

    async fn has_chunk(&self, content: &str, label: SemanticLabel) -> Result<bool> {
        self.gate("has_chunk")?;
        self.inner.has_chunk(content, label).await
    }

    async fn count_chunks(&self) -> Result<i64> {
        self.gate("count_chunks")?;
        self.inner.count_chunks().await
    }

    async fn search_chunks_fts(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>> {
        self.gate("search_chunks_fts")?;
        self.inner.search_chunks_fts(query, top_k).await
    }

    async fn list_chunks_with_embeddings(&self) -> Result<Vec<Chunk>> {
        self.gate("list_chunks_with_embeddings")?;
        self.inner.list_chunks_with_embeddings().await
    }

    async fn is_session_processed(&self, source_session_id: &str) -> Result<bool> {
        self.gate("is_session_processed")?;
        self.inner.is_session_processed(source_session_id).await
    }

    async fn mark_session_processed(&self, source_session_id: &str) -> Result<()> {
        self.gate("mark_session_processed")?;
        self.inner.mark_session_processed(source_session_id).await
    }

    async fn clear_processed_sessions(&self, filter: &ClearFilter) -> Result<usize> {
        self.gate("clear_processed_sessions")?;
        self.inner.clear_processed_sessions(filter).await
    }

    async fn get_session_checkpoint(
        &self,
        source_session_id: &str,
    ) -> Result<Option<SessionCheckpoint>> {
        self.gate("get_session_checkpoint")?;
        self.inner.get_session_checkpoint(source_session_id).await
    }

    async fn save_session_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        self.gate("save_session_checkpoint")?;
        self.inner.save_session_checkpoint(checkpoint).await
    }

    async fn clear_session_checkpoints(&self, filter: &ClearFilter) -> Result<usize> {
        self.gate("clear_session_checkpoints")?;
        self.inner.clear_session_checkpoints(filter).await
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        self.gate("get_stats")?;
        self.inner.get_stats().await
    }

    async fn get_last_processed_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.gate("get_last_processed_at")?;
        self.inner.get_last_processed_at().await
    }

    async fn list_recent_source_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<RecentSourceSession>> {
        self.gate("list_recent_source_sessions")?;
        self.inner.list_recent_source_sessions(limit).await
    }

    async fn get_background_sync_status(&self) -> Result<BackgroundSyncStatus> {
        self.gate("get_background_sync_status")?;
        self.inner.get_background_sync_status().await
    }

    async fn save_background_sync_status(&self, status: &BackgroundSyncStatus) -> Result<()> {
        self.gate("save_background_sync_status")?;
        self.inner.save_background_sync_status(status).await
    }
}
