//! Session lifecycle and explicit logging.
//!
//! At most one session is active per scope. The active pointer lives in
//! storage, so every process sharing a backend sees the same session.

use crate::error::{Error, Result};
use crate::models::{LogEntry, LogSource, SemanticLabel, Session, SessionStatus};
use crate::storage::Storage;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SessionManager {
    storage: Arc<dyn Storage>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Start a session for `task`, abandoning whatever was active.
    pub async fn start(&self, task: &str) -> Result<Session> {
        let session = Session::new(task);
        session.validate()?;

        if let Some(mut active) = self.storage.get_active_session().await? {
            active.status = SessionStatus::Abandoned;
            active.ended_at = Some(Utc::now());
            self.storage.update_session(&active).await?;
            info!(session_id = %active.id, "Abandoned previous session");
        }

        self.storage.create_session(&session).await?;
        info!(session_id = %session.id, task = %session.task, "Started session");
        Ok(session)
    }

    /// Complete the active session.
    pub async fn end(&self, summary: &str) -> Result<Session> {
        let active = self
            .storage
            .get_active_session()
            .await?
            .ok_or_else(|| Error::NotFound("no active session".to_string()))?;
        self.complete(active, summary).await
    }

    /// Complete a specific session, active or not.
    pub async fn end_session(&self, id: Uuid, summary: &str) -> Result<Session> {
        let session = self
            .storage
            .get_session(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        self.complete(session, summary).await
    }

    pub async fn get_active(&self) -> Result<Option<Session>> {
        self.storage.get_active_session().await
    }

    async fn complete(&self, mut session: Session, summary: &str) -> Result<Session> {
        session.status = SessionStatus::Completed;
        session.ended_at = Some(Utc::now());
        session.summary = Some(summary.to_string());
        self.storage.update_session(&session).await?;
        info!(session_id = %session.id, entries = session.entry_count, "Completed session");
        Ok(session)
    }
}

pub struct LogWriter {
    storage: Arc<dyn Storage>,
}

impl LogWriter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Record an explicit observation, attached to the active session when
    /// there is one.
    pub async fn log(
        &self,
        content: &str,
        label: SemanticLabel,
        tags: Vec<String>,
        confidence: f64,
    ) -> Result<LogEntry> {
        let mut entry = LogEntry::new(LogSource::Explicit, content, label)
            .with_tags(tags)
            .with_confidence(confidence);
        entry.validate()?;
        if let Some(active) = self.storage.get_active_session().await? {
            entry = entry.with_session(active.id);
        }
        self.storage.append_entry(&entry).await?;
        debug!(entry_id = %entry.id, label = %label, "Logged entry");
        Ok(entry)
    }

    /// Record an entry derived from an ingested transcript.
    pub async fn log_ingested(
        &self,
        content: &str,
        label: SemanticLabel,
        source_session_id: &str,
        tags: Vec<String>,
        confidence: f64,
    ) -> Result<LogEntry> {
        let entry = LogEntry::new(LogSource::Ingested, content, label)
            .with_source_session(source_session_id)
            .with_tags(tags)
            .with_confidence(confidence);
        entry.validate()?;
        self.storage.append_entry(&entry).await?;
        debug!(entry_id = %entry.id, source_session_id, "Logged ingested entry");
        Ok(entry)
    }
}
