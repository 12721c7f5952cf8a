//! Normalized transcript model and the ingestion collaborator traits.
//!
//! Adapters for specific agent tools implement [`SessionIngester`]; the core
//! only sees [`RawSession`] values and stable per-source session ids.

use crate::models::LogEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tool invocation captured in a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    pub result: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
    pub duration_ms: Option<u64>,
}

fn default_success() -> bool {
    true
}

impl RawToolCall {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: serde_json::Map::new(),
            result: None,
            success: true,
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// "user" or "assistant"
    pub role: String,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tool_calls: Vec<RawToolCall>,
}

impl RawMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            timestamp: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }
}

/// One agent session in tool-independent form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSession {
    /// Ingester source name, e.g. "cursor" or "claude-code"
    pub source: String,
    pub session_id: String,
    pub title: Option<String>,
    pub project_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub messages: Vec<RawMessage>,
}

impl RawSession {
    pub fn new(source: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            session_id: session_id.into(),
            title: None,
            project_path: None,
            started_at: Utc::now(),
            ended_at: None,
            messages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<RawMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Human-readable duration, "unknown" while the session is open.
    pub fn duration_label(&self) -> String {
        let Some(ended_at) = self.ended_at else {
            return "unknown".to_string();
        };
        let minutes = (ended_at - self.started_at).num_minutes().max(0);
        if minutes < 60 {
            format!("{minutes} minutes")
        } else {
            format!("{}h {}m", minutes / 60, minutes % 60)
        }
    }
}

/// Discovers and parses native sessions of one agent tool.
pub trait SessionIngester: Send + Sync {
    /// Identifier such as "cursor" or "claude-code".
    fn source_name(&self) -> &str;

    /// Session files or databases that may hold new content.
    fn discover_sessions(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<PathBuf>>;

    fn parse_session(&self, path: &Path) -> anyhow::Result<RawSession>;

    /// Stable id used for processed-session and checkpoint tracking.
    fn get_session_id(&self, path: &Path) -> anyhow::Result<String>;
}

/// Turns a transcript into log entries.
#[async_trait]
pub trait LearningExtractor: Send + Sync {
    async fn extract(&self, session: &RawSession) -> anyhow::Result<Vec<LogEntry>>;
}

/// Normalize a source name for comparisons: `Claude_Code` -> `claude-code`.
pub fn normalize_source(source: &str) -> String {
    source.trim().to_lowercase().replace('_', "-")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;

    /// In-memory ingester keyed by fake paths.
    pub(crate) struct StaticIngester {
        name: String,
        sessions: BTreeMap<PathBuf, RawSession>,
    }

    impl StaticIngester {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                sessions: BTreeMap::new(),
            }
        }

        pub(crate) fn with_session(mut self, session: RawSession) -> Self {
            let path = PathBuf::from(format!("/sessions/{}.jsonl", session.session_id));
            self.sessions.insert(path, session);
            self
        }
    }

    impl SessionIngester for StaticIngester {
        fn source_name(&self) -> &str {
            &self.name
        }

        fn discover_sessions(&self, _: Option<DateTime<Utc>>) -> anyhow::Result<Vec<PathBuf>> {
            Ok(self.sessions.keys().cloned().collect())
        }

        fn parse_session(&self, path: &Path) -> anyhow::Result<RawSession> {
            self.sessions
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown session {}", path.display()))
        }

        fn get_session_id(&self, path: &Path) -> anyhow::Result<String> {
            self.parse_session(path).map(|s| s.session_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_duration_label() {
        let mut session = RawSession::new("codex", "codex-1");
        assert_eq!(session.duration_label(), "unknown");

        session.ended_at = Some(session.started_at + Duration::minutes(42));
        assert_eq!(session.duration_label(), "42 minutes");

        session.ended_at = Some(session.started_at + Duration::minutes(135));
        assert_eq!(session.duration_label(), "2h 15m");
    }

    #[test]
    fn test_normalize_source() {
        assert_eq!(normalize_source(" Claude_Code "), "claude-code");
        assert_eq!(normalize_source("cursor"), "cursor");
    }

    #[test]
    fn test_raw_session_deserializes_defaults() {
        let json = r#"{
            "source": "cursor",
            "session_id": "cursor-1",
            "title": null,
            "project_path": null,
            "started_at": "2026-01-02T03:04:05Z",
            "ended_at": null,
            "messages": [
                {"role": "user", "content": "hi", "timestamp": null,
                 "tool_calls": [{"tool": "Read", "result": null, "duration_ms": null}]}
            ]
        }"#;
        let session: RawSession = serde_json::from_str(json).unwrap();
        assert!(session.messages[0].is_user());
        assert!(session.messages[0].tool_calls[0].success);
        assert!(session.messages[0].tool_calls[0].args.is_empty());
    }
}
