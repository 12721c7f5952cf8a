//! HTTP client for a shared storage service.
//!
//! Each [`Storage`] method maps to one REST endpoint under the base URL. The
//! tenant/project scope travels in `X-Tenant-Id` / `X-Project-Id` headers.

use super::{ClearFilter, Storage};
use crate::config::SharedStorageConfig;
use crate::error::{Error, Result};
use crate::models::{
    BackgroundSyncStatus, Chunk, LogEntry, RecentSourceSession, Scope, SemanticLabel, Session,
    SessionCheckpoint, SessionStatus, StorageStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

const TENANT_HEADER: &str = "X-Tenant-Id";
const PROJECT_HEADER: &str = "X-Project-Id";

/// Storage backend speaking to a remote memory service.
#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: Url,
    scope: Scope,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: &str, scope: Scope, config: &SharedStorageConfig) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::validation(format!("invalid shared storage url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::validation(format!(
                "shared storage url cannot be a base: {base_url}"
            )));
        }

        let token = config.api_key_env.as_deref().and_then(|var| match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => {
                warn!(env = var, "Shared storage API key variable is not set");
                None
            }
        });

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            scope,
            token,
        })
    }

    /// Set the bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // HTTP Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::validation("shared storage url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let url = self.endpoint(segments)?;
        debug!(%method, %url, "Shared storage request");

        let mut req = self
            .client
            .request(method, url)
            .header(TENANT_HEADER, &self.scope.tenant_id)
            .header(PROJECT_HEADER, &self.scope.project_id);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::http(status.as_u16(), format!("shared storage returned {status}: {body}")))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        Ok(self.send(req).await?.json().await?)
    }

    /// Like `send_json`, mapping 404 to `None`.
    async fn send_optional<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<Option<T>> {
        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::http(
                status.as_u16(),
                format!("shared storage returned {status}: {body}"),
            ));
        }
        Ok(Some(resp.json().await?))
    }

    async fn send_empty(&self, req: RequestBuilder) -> Result<()> {
        self.send(req).await?;
        Ok(())
    }

    fn clear_query(filter: &ClearFilter) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(source) = &filter.source {
            query.push(("source", source.clone()));
        }
        if let Some(id) = &filter.source_session_id {
            query.push(("source_session_id", id.clone()));
        }
        query
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CountResponse {
    count: i64,
}

#[derive(Deserialize)]
struct InsertedResponse {
    inserted: bool,
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

#[derive(Deserialize)]
struct ProcessedResponse {
    processed: bool,
}

#[derive(Deserialize)]
struct RemovedResponse {
    removed: usize,
}

#[derive(Deserialize)]
struct LastProcessedResponse {
    processed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ChunkExistsRequest<'a> {
    content: &'a str,
    label: SemanticLabel,
}

#[derive(Serialize)]
struct StartSyncRequest {
    pid: u32,
}

#[derive(Serialize)]
struct CompleteSyncRequest {
    sessions_processed: i64,
    learnings_extracted: i64,
    error_message: Option<String>,
}

#[async_trait]
impl Storage for HttpStore {
    fn scope(&self) -> &Scope {
        &self.scope
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        session.validate()?;
        self.send_empty(self.request(Method::POST, &["sessions"])?.json(session))
            .await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let id = id.to_string();
        self.send_optional(self.request(Method::GET, &["sessions", &id])?)
            .await
    }

    async fn get_active_session(&self) -> Result<Option<Session>> {
        self.send_optional(self.request(Method::GET, &["sessions", "active"])?)
            .await
    }

    async fn list_sessions(
        &self,
        limit: usize,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(status) = status {
            query.push(("status", status.as_str().to_string()));
        }
        self.send_json(self.request(Method::GET, &["sessions"])?.query(&query))
            .await
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let id = session.id.to_string();
        self.send_empty(self.request(Method::PUT, &["sessions", &id])?.json(session))
            .await
    }

    async fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        entry.validate()?;
        self.send_empty(self.request(Method::POST, &["entries"])?.json(entry))
            .await
    }

    async fn get_entries(&self, session_id: Uuid) -> Result<Vec<LogEntry>> {
        let id = session_id.to_string();
        self.send_json(self.request(Method::GET, &["sessions", &id, "entries"])?)
            .await
    }

    async fn get_entries_by_label(
        &self,
        labels: &[SemanticLabel],
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let labels = labels.iter().map(|l| l.as_str()).collect::<Vec<_>>().join(",");
        let query = [("labels", labels), ("limit", limit.to_string())];
        self.send_json(self.request(Method::GET, &["entries"])?.query(&query))
            .await
    }

    async fn count_log_entries(&self) -> Result<i64> {
        let resp: CountResponse = self
            .send_json(self.request(Method::GET, &["entries", "count"])?)
            .await?;
        Ok(resp.count)
    }

    async fn store_chunk(&self, chunk: &Chunk) -> Result<bool> {
        let resp: InsertedResponse = self
            .send_json(self.request(Method::POST, &["chunks"])?.json(chunk))
            .await?;
        Ok(resp.inserted)
    }

    async fn has_chunk(&self, content: &str, label: SemanticLabel) -> Result<bool> {
        let body = ChunkExistsRequest { content, label };
        let resp: ExistsResponse = self
            .send_json(self.request(Method::POST, &["chunks", "exists"])?.json(&body))
            .await?;
        Ok(resp.exists)
    }

    async fn count_chunks(&self) -> Result<i64> {
        let resp: CountResponse = self
            .send_json(self.request(Method::GET, &["chunks", "count"])?)
            .await?;
        Ok(resp.count)
    }

    async fn search_chunks_fts(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>> {
        let params = [("q", query.to_string()), ("top_k", top_k.to_string())];
        self.send_json(self.request(Method::GET, &["chunks", "search"])?.query(&params))
            .await
    }

    async fn list_chunks_with_embeddings(&self) -> Result<Vec<Chunk>> {
        self.send_json(self.request(Method::GET, &["chunks", "embedded"])?)
            .await
    }

    async fn is_session_processed(&self, source_session_id: &str) -> Result<bool> {
        let resp: Option<ProcessedResponse> = self
            .send_optional(self.request(Method::GET, &["processed-sessions", source_session_id])?)
            .await?;
        Ok(resp.is_some_and(|r| r.processed))
    }

    async fn mark_session_processed(&self, source_session_id: &str) -> Result<()> {
        self.send_empty(self.request(Method::PUT, &["processed-sessions", source_session_id])?)
            .await
    }

    async fn clear_processed_sessions(&self, filter: &ClearFilter) -> Result<usize> {
        let resp: RemovedResponse = self
            .send_json(
                self.request(Method::DELETE, &["processed-sessions"])?
                    .query(&Self::clear_query(filter)),
            )
            .await?;
        Ok(resp.removed)
    }

    async fn get_session_checkpoint(
        &self,
        source_session_id: &str,
    ) -> Result<Option<SessionCheckpoint>> {
        self.send_optional(self.request(Method::GET, &["checkpoints", source_session_id])?)
            .await
    }

    async fn save_session_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        self.send_empty(
            self.request(Method::PUT, &["checkpoints", &checkpoint.source_session_id])?
                .json(checkpoint),
        )
        .await
    }

    async fn clear_session_checkpoints(&self, filter: &ClearFilter) -> Result<usize> {
        let resp: RemovedResponse = self
            .send_json(
                self.request(Method::DELETE, &["checkpoints"])?
                    .query(&Self::clear_query(filter)),
            )
            .await?;
        Ok(resp.removed)
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        self.send_json(self.request(Method::GET, &["stats"])?).await
    }

    async fn get_last_processed_at(&self) -> Result<Option<DateTime<Utc>>> {
        let resp: LastProcessedResponse = self
            .send_json(self.request(Method::GET, &["processed-sessions", "last"])?)
            .await?;
        Ok(resp.processed_at)
    }

    async fn list_recent_source_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<RecentSourceSession>> {
        self.send_json(
            self.request(Method::GET, &["source-sessions", "recent"])?
                .query(&[("limit", limit.to_string())]),
        )
        .await
    }

    async fn get_background_sync_status(&self) -> Result<BackgroundSyncStatus> {
        let status: Option<BackgroundSyncStatus> = self
            .send_optional(self.request(Method::GET, &["background-sync", "status"])?)
            .await?;
        Ok(status.unwrap_or_default())
    }

    async fn save_background_sync_status(&self, status: &BackgroundSyncStatus) -> Result<()> {
        self.send_empty(
            self.request(Method::PUT, &["background-sync", "status"])?
                .json(status),
        )
        .await
    }

    async fn start_background_sync(&self, pid: u32) -> Result<BackgroundSyncStatus> {
        self.send_json(
            self.request(Method::POST, &["background-sync", "start"])?
                .json(&StartSyncRequest { pid }),
        )
        .await
    }

    async fn complete_background_sync(
        &self,
        sessions_processed: i64,
        learnings_extracted: i64,
        error_message: Option<String>,
    ) -> Result<BackgroundSyncStatus> {
        let body = CompleteSyncRequest {
            sessions_processed,
            learnings_extracted,
            error_message,
        };
        self.send_json(
            self.request(Method::POST, &["background-sync", "complete"])?
                .json(&body),
        )
        .await
    }
}
