//! Retry and fallback envelope around a shared storage delegate.
//!
//! Every operation goes to the delegate first. Transient failures are retried
//! with exponential backoff (initial delay doubling per attempt, capped). Once
//! attempts are exhausted the optional local fallback serves the call; without
//! one the caller gets [`Error::BackendUnavailable`]. Non-transient errors
//! propagate on the first attempt.

use super::{ClearFilter, Storage};
use crate::config::SharedStorageConfig;
use crate::error::{Error, Result};
use crate::models::{
    BackgroundSyncStatus, Chunk, LogEntry, RecentSourceSession, Scope, SemanticLabel, Session,
    SessionCheckpoint, SessionStatus, StorageStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Backoff schedule for shared storage calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts against the delegate, at least 1
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &SharedStorageConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Shared-backend wrapper with bounded retries and optional local fallback.
pub struct RemoteStore {
    delegate: Arc<dyn Storage>,
    fallback: Option<Arc<dyn Storage>>,
    policy: RetryPolicy,
    cancel: Option<watch::Receiver<bool>>,
}

impl RemoteStore {
    pub fn new(delegate: Arc<dyn Storage>, policy: RetryPolicy) -> Self {
        Self {
            delegate,
            fallback: None,
            policy,
            cancel: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Storage>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Abort pending backoff sleeps once the channel flips to `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn execute<'a, T, F>(&'a self, operation: &'static str, call: F) -> Result<T>
    where
        T: Send,
        F: Fn(&'a dyn Storage) -> BoxFuture<'a, Result<T>> + Send + Sync,
    {
        let attempts = self.policy.attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match call(self.delegate.as_ref()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Shared storage call recovered");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Shared storage call failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        self.pause(self.policy.backoff(attempt)).await?;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let last_error = last_error
            .unwrap_or_else(|| Error::Other(format!("{operation} made no attempts")));

        let source = match &self.fallback {
            Some(fallback) => {
                warn!(operation, error = %last_error, "Shared storage unavailable, using local fallback");
                match call(fallback.as_ref()).await {
                    Ok(value) => return Ok(value),
                    Err(fallback_error) => fallback_error,
                }
            }
            None => last_error,
        };

        Err(Error::BackendUnavailable {
            operation: operation.to_string(),
            attempts,
            source: Box::new(source),
        })
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        let Some(cancel) = &self.cancel else {
            tokio::time::sleep(delay).await;
            return Ok(());
        };

        let mut cancel = cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = wait_cancelled(&mut cancel) => Err(Error::Other("retry cancelled".into())),
        }
    }
}

pub(crate) async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone, nothing can cancel anymore
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Storage for RemoteStore {
    fn scope(&self) -> &Scope {
        self.delegate.scope()
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.execute("create_session", |s| s.create_session(session)).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.execute("get_session", |s| s.get_session(id)).await
    }

    async fn get_active_session(&self) -> Result<Option<Session>> {
        self.execute("get_active_session", |s| s.get_active_session()).await
    }

    async fn list_sessions(
        &self,
        limit: usize,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>> {
        self.execute("list_sessions", |s| s.list_sessions(limit, status)).await
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        self.execute("update_session", |s| s.update_session(session)).await
    }

    async fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        self.execute("append_entry", |s| s.append_entry(entry)).await
    }

    async fn get_entries(&self, session_id: Uuid) -> Result<Vec<LogEntry>> {
        self.execute("get_entries", |s| s.get_entries(session_id)).await
    }

    async fn get_entries_by_label(
        &self,
        labels: &[SemanticLabel],
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        self.execute("get_entries_by_label", |s| s.get_entries_by_label(labels, limit))
            .await
    }

    async fn count_log_entries(&self) -> Result<i64> {
        self.execute("count_log_entries", |s| s.count_log_entries()).await
    }

    async fn store_chunk(&self, chunk: &Chunk) -> Result<bool> {
        self.execute("store_chunk", |s| s.store_chunk(chunk)).await
    }

    async fn has_chunk(&self, content: &str, label: SemanticLabel) -> Result<bool> {
        self.execute("has_chunk", |s| s.has_chunk(content, label)).await
    }

    async fn count_chunks(&self) -> Result<i64> {
        self.execute("count_chunks", |s| s.count_chunks()).await
    }

    async fn search_chunks_fts(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>> {
        self.execute("search_chunks_fts", |s| s.search_chunks_fts(query, top_k)).await
    }

    async fn list_chunks_with_embeddings(&self) -> Result<Vec<Chunk>> {
        self.execute("list_chunks_with_embeddings", |s| s.list_chunks_with_embeddings())
            .await
    }

    async fn is_session_processed(&self, source_session_id: &str) -> Result<bool> {
        self.execute("is_session_processed", |s| s.is_session_processed(source_session_id))
            .await
    }

    async fn mark_session_processed(&self, source_session_id: &str) -> Result<()> {
        self.execute("mark_session_processed", |s| {
            s.mark_session_processed(source_session_id)
        })
        .await
    }

    async fn clear_processed_sessions(&self, filter: &ClearFilter) -> Result<usize> {
        self.execute("clear_processed_sessions", |s| s.clear_processed_sessions(filter))
            .await
    }

    async fn get_session_checkpoint(
        &self,
        source_session_id: &str,
    ) -> Result<Option<SessionCheckpoint>> {
        self.execute("get_session_checkpoint", |s| {
            s.get_session_checkpoint(source_session_id)
        })
        .await
    }

    async fn save_session_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        self.execute("save_session_checkpoint", |s| s.save_session_checkpoint(checkpoint))
            .await
    }

    async fn clear_session_checkpoints(&self, filter: &ClearFilter) -> Result<usize> {
        self.execute("clear_session_checkpoints", |s| s.clear_session_checkpoints(filter))
            .await
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        self.execute("get_stats", |s| s.get_stats()).await
    }

    async fn get_last_processed_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.execute("get_last_processed_at", |s| s.get_last_processed_at()).await
    }

    async fn list_recent_source_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<RecentSourceSession>> {
        self.execute("list_recent_source_sessions", |s| {
            s.list_recent_source_sessions(limit)
        })
        .await
    }

    async fn get_background_sync_status(&self) -> Result<BackgroundSyncStatus> {
        self.execute("get_background_sync_status", |s| s.get_background_sync_status())
            .await
    }

    async fn save_background_sync_status(&self, status: &BackgroundSyncStatus) -> Result<()> {
        self.execute("save_background_sync_status", |s| {
            s.save_background_sync_status(status)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkSource;
    use crate::storage::LocalStore;
    use crate::storage::testing::FlakyStore;

    fn scope() -> Scope {
        Scope::new("org-1", "repo-1")
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn timeout() -> Error {
        Error::Timeout("shared store".into())
    }

    fn unavailable() -> Error {
        Error::http(503, "service unavailable")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(200), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).attempts, 1);
    }

    #[test]
    fn test_policy_from_config() {
        let config = SharedStorageConfig {
            retry_attempts: 4,
            retry_backoff_ms: 50,
            max_backoff_ms: 1000,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.attempts, 4);
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
        assert_eq!(policy.max_backoff, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let flaky = Arc::new(FlakyStore::in_memory(scope()).failing(2, timeout));
        let remote = RemoteStore::new(flaky.clone(), fast_policy(3));

        let session = Session::new("retry me");
        remote.create_session(&session).await.unwrap();

        assert_eq!(flaky.calls(), 3);
        assert!(remote.get_session(session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let flaky = Arc::new(
            FlakyStore::in_memory(scope()).always_failing(|| Error::validation("bad request")),
        );
        let remote = RemoteStore::new(flaky.clone(), fast_policy(5));

        let err = remote.count_chunks().await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_without_fallback() {
        let flaky = Arc::new(FlakyStore::in_memory(scope()).always_failing(unavailable));
        let remote = RemoteStore::new(flaky.clone(), fast_policy(3));

        let err = remote.get_stats().await.unwrap_err();
        match &err {
            Error::BackendUnavailable {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "get_stats");
                assert_eq!(*attempts, 3);
                assert!(source.to_string().contains("503"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(flaky.calls(), 3);
        assert!(err.to_string().starts_with("get_stats failed after 3 attempts"));
    }

    #[tokio::test]
    async fn test_exhaustion_uses_fallback() {
        let flaky = Arc::new(FlakyStore::in_memory(scope()).always_failing(timeout));
        let fallback = Arc::new(LocalStore::open_in_memory(scope()).unwrap());
        let remote =
            RemoteStore::new(flaky.clone(), fast_policy(2)).with_fallback(fallback.clone());

        let chunk = Chunk::new(ChunkSource::Manual, "fallback write", SemanticLabel::Pattern);
        assert!(remote.store_chunk(&chunk).await.unwrap());

        assert_eq!(flaky.calls(), 2);
        assert_eq!(fallback.count_chunks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_reported() {
        let flaky = Arc::new(FlakyStore::in_memory(scope()).always_failing(timeout));
        let fallback = Arc::new(
            FlakyStore::in_memory(scope()).always_failing(|| Error::Other("disk full".into())),
        );
        let remote = RemoteStore::new(flaky, fast_policy(2)).with_fallback(fallback);

        let err = remote.count_log_entries().await.unwrap_err();
        assert!(err.is_backend_unavailable());
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let flaky = Arc::new(FlakyStore::in_memory(scope()).always_failing(timeout));
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let remote = RemoteStore::new(flaky.clone(), policy).with_cancellation(rx);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        });

        let started = std::time::Instant::now();
        let err = remote.count_chunks().await.unwrap_err();
        cancel.await.unwrap();

        assert!(err.to_string().contains("retry cancelled"));
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn test_default_methods_route_through_retry() {
        let flaky = Arc::new(
            FlakyStore::in_memory(scope())
                .failing(1, timeout)
                .only("save_background_sync_status"),
        );
        let remote = RemoteStore::new(flaky.clone(), fast_policy(3));

        let status = remote.start_background_sync(99).await.unwrap();
        assert!(status.is_running);
        assert_eq!(flaky.calls(), 2);
        assert_eq!(remote.scope(), &scope());
    }
}
