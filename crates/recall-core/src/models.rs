//! Domain types shared by every storage backend.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of a log entry's content, in characters.
pub const MAX_ENTRY_CONTENT_CHARS: usize = 10_000;

/// Tenant/project ids used when nothing is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::validation(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────────────────────────

/// Determines compaction behavior and tier promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticLabel {
    HardFailure,
    Gotcha,
    Correction,
    Preference,
    Pattern,
    #[serde(rename = "decision")]
    DecisionRationale,
    Exploration,
    Narrative,
}

string_enum!(SemanticLabel {
    HardFailure => "hard_failure",
    Gotcha => "gotcha",
    Correction => "correction",
    Preference => "preference",
    Pattern => "pattern",
    DecisionRationale => "decision",
    Exploration => "exploration",
    Narrative => "narrative",
});

impl SemanticLabel {
    /// Labels promoted into the guardrails tier.
    pub const GUARDRAIL: [SemanticLabel; 3] = [Self::HardFailure, Self::Gotcha, Self::Correction];

    /// Labels promoted into the style tier.
    pub const STYLE: [SemanticLabel; 2] = [Self::Preference, Self::Pattern];
}

/// Provenance of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Explicit,
    Ingested,
    Extracted,
    Manual,
}

string_enum!(LogSource {
    Explicit => "explicit",
    Ingested => "ingested",
    Extracted => "extracted",
    Manual => "manual",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

string_enum!(SessionStatus {
    Active => "active",
    Completed => "completed",
    Abandoned => "abandoned",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    LogEntry,
    Compaction,
    Import,
    Manual,
}

string_enum!(ChunkSource {
    LogEntry => "log_entry",
    Compaction => "compaction",
    Import => "import",
    Manual => "manual",
});

// ─────────────────────────────────────────────────────────────────────────────
// Scope
// ─────────────────────────────────────────────────────────────────────────────

/// Tenant/project pair every persisted row is scoped by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub project_id: String,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            tenant_id: DEFAULT_NAMESPACE.to_string(),
            project_id: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
        }
    }

    /// Shared backends must not run under the implicit default namespace.
    pub fn validate_shared_namespace(&self) -> Result<()> {
        validate_namespace_part("tenant_id", &self.tenant_id)?;
        validate_namespace_part("project_id", &self.project_id)
    }
}

fn validate_namespace_part(field: &str, value: &str) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(format!("{field} must not be empty")));
    }
    if trimmed == DEFAULT_NAMESPACE {
        return Err(Error::validation(format!(
            "{field} must be set explicitly for shared storage (got \"default\")"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity Types
// ─────────────────────────────────────────────────────────────────────────────

/// Atomic unit of captured knowledge. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub source: LogSource,
    pub source_session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub label: SemanticLabel,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_confidence() -> f64 {
    1.0
}

impl LogEntry {
    pub fn new(source: LogSource, content: impl Into<String>, label: SemanticLabel) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: None,
            source,
            source_session_id: None,
            timestamp: Utc::now(),
            content: content.into(),
            label,
            tags: Vec::new(),
            confidence: 1.0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_source_session(mut self, source_session_id: impl Into<String>) -> Self {
        self.source_session_id = Some(source_session_id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        let chars = self.content.trim().chars().count();
        if chars == 0 {
            return Err(Error::validation("log entry content must not be empty"));
        }
        if self.content.chars().count() > MAX_ENTRY_CONTENT_CHARS {
            return Err(Error::validation(format!(
                "log entry content exceeds {MAX_ENTRY_CONTENT_CHARS} characters"
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(Error::validation(format!(
                "confidence must be between 0.0 and 1.0 (got {})",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// Container for a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub task: String,
    pub summary: Option<String>,
    #[serde(default)]
    pub entry_count: i64,
}

impl Session {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            task: task.into(),
            summary: None,
            entry_count: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.task.trim().is_empty() {
            return Err(Error::validation("session task must not be empty"));
        }
        Ok(())
    }
}

/// Indexed unit for retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub source: ChunkSource,
    #[serde(default)]
    pub source_ids: Vec<Uuid>,
    pub content: String,
    pub label: SemanticLabel,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub token_count: Option<i64>,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn new(source: ChunkSource, content: impl Into<String>, label: SemanticLabel) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            source_ids: Vec::new(),
            content: content.into(),
            label,
            tags: Vec::new(),
            created_at: Utc::now(),
            token_count: None,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Content and tags joined the way the full-text index sees them.
    pub fn searchable_text(&self) -> String {
        if self.tags.is_empty() {
            self.content.clone()
        } else {
            format!("{} {}", self.content, self.tags.join(" "))
        }
    }
}

/// Incremental-ingestion cursor for one source session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub id: Uuid,
    pub source_session_id: String,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub last_message_index: Option<i64>,
    pub content_hash: Option<String>,
    pub checkpoint_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionCheckpoint {
    pub fn new(source_session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_session_id: source_session_id.into(),
            last_message_timestamp: None,
            last_message_index: None,
            content_hash: None,
            checkpoint_at: now,
            updated_at: now,
        }
    }
}

/// Singleton-per-scope record owned by the background sync manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSyncStatus {
    pub id: Uuid,
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sessions_processed: i64,
    pub learnings_extracted: i64,
    pub error_message: Option<String>,
    pub pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl Default for BackgroundSyncStatus {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            is_running: false,
            started_at: None,
            completed_at: None,
            sessions_processed: 0,
            learnings_extracted: 0,
            error_message: None,
            pid: None,
            updated_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregates
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub processed_sessions: i64,
    pub log_entries: i64,
    pub chunks: i64,
    pub checkpoints: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHighlight {
    pub label: String,
    pub content: String,
}

/// Summary of a source session inferred from its log entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentSourceSession {
    pub source_session_id: String,
    pub last_timestamp: DateTime<Utc>,
    pub entry_count: i64,
    pub highlights: Vec<SessionHighlight>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        for label in [
            SemanticLabel::HardFailure,
            SemanticLabel::DecisionRationale,
            SemanticLabel::Narrative,
        ] {
            assert_eq!(label.as_str().parse::<SemanticLabel>().unwrap(), label);
        }
        assert_eq!(
            serde_json::to_string(&SemanticLabel::DecisionRationale).unwrap(),
            "\"decision\""
        );
        assert!("bogus".parse::<SemanticLabel>().is_err());
    }

    #[test]
    fn test_entry_validation() {
        let ok = LogEntry::new(LogSource::Explicit, "Use WAL mode", SemanticLabel::Pattern);
        assert!(ok.validate().is_ok());

        let empty = LogEntry::new(LogSource::Explicit, "   ", SemanticLabel::Pattern);
        assert!(empty.validate().unwrap_err().is_validation());

        let too_long = LogEntry::new(
            LogSource::Explicit,
            "x".repeat(MAX_ENTRY_CONTENT_CHARS + 1),
            SemanticLabel::Pattern,
        );
        assert!(too_long.validate().is_err());

        let bad_confidence = ok.clone().with_confidence(1.5);
        assert!(bad_confidence.validate().is_err());
    }

    #[test]
    fn test_shared_namespace_validation() {
        assert!(Scope::new("org-123", "repo-abc").validate_shared_namespace().is_ok());

        let err = Scope::new("default", "repo").validate_shared_namespace().unwrap_err();
        assert!(err.to_string().contains("tenant_id"));

        let err = Scope::new("org", "default").validate_shared_namespace().unwrap_err();
        assert!(err.to_string().contains("project_id"));

        assert!(Scope::new("   ", "repo").validate_shared_namespace().is_err());
        assert!(Scope::new("org", "").validate_shared_namespace().is_err());
    }
}
