//! LLM-driven tier compaction over the raw log.
//!
//! Guardrail and style entries are summarized into their tiers, completed
//! sessions are summarized into RECENT, and every guardrail/style entry is
//! indexed as a retrievable chunk.

use super::compaction::compact_if_over_tokens;
use super::format::{merge_tier_content, parse_tier_content};
use super::{KnowledgeTier, TierFiles};
use crate::config::TierCompactionConfig;
use crate::embedding::{DEFAULT_DIMENSIONS, embed_text};
use crate::error::Result;
use crate::llm::{GenerationOptions, TextGenerator, generate_text};
use crate::models::{Chunk, ChunkSource, LogEntry, SemanticLabel, SessionStatus};
use crate::storage::Storage;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const GUARDRAILS_PROMPT: &str = "You are reviewing development session logs to find hard rules and warnings.

Current GUARDRAILS.md:
{current}

New log entries:
{entries}

List only guardrails that are NOT already in the current file. A guardrail is one of:
- a hard failure: \"Never do X because Y\"
- a gotcha: \"Watch out for X, it causes Y\"
- a correction: \"Don't do X, do Y instead\"

Write one per line:
- [FAILURE] Description with why
- [GOTCHA] Description with why
- [CORRECTION] Don't X, do Y instead

If there is nothing new, reply with exactly: NONE";

const STYLE_PROMPT: &str = "You are reviewing development session logs to find coding patterns and preferences.

Current STYLE.md:
{current}

New log entries:
{entries}

List only style guidelines that are NOT already in the current file:
- preferences: \"Prefer X over Y\"
- patterns: \"Use X pattern for Y\"

Write one per line:
- [PREFERENCE] Description
- [PATTERN] Description

If there is nothing new, reply with exactly: NONE";

const RECENT_PROMPT: &str = "Summarize these development sessions for quick reference.

Sessions:
{sessions}

Write ONE line per session in this format:
**YYYY-MM-DD**: 1-2 sentence summary of task and outcome

Be concise.";

/// Reply meaning "no new knowledge".
const NO_CHANGE: &str = "NONE";
const RECENT_SESSION_LIMIT: usize = 20;
const ENTRY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionResult {
    pub guardrails_updated: bool,
    pub style_updated: bool,
    pub recent_updated: bool,
    /// Newly stored chunks; already indexed entries are not counted.
    pub chunks_indexed: usize,
}

pub struct CompactionEngine {
    storage: Arc<dyn Storage>,
    files: TierFiles,
    generator: Arc<dyn TextGenerator>,
    options: GenerationOptions,
    embedding_dimensions: usize,
    token_budget: Option<(usize, TierCompactionConfig)>,
}

impl CompactionEngine {
    pub fn new(storage: Arc<dyn Storage>, files: TierFiles, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            storage,
            files,
            generator,
            options: GenerationOptions::default(),
            embedding_dimensions: DEFAULT_DIMENSIONS,
            token_budget: None,
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_embedding_dimensions(mut self, dimensions: usize) -> Self {
        self.embedding_dimensions = dimensions;
        self
    }

    /// Run the tier compaction hook on any tier whose estimated token count
    /// exceeds `max_tokens` after an update.
    pub fn with_token_budget(mut self, max_tokens: usize, config: TierCompactionConfig) -> Self {
        self.token_budget = Some((max_tokens, config));
        self
    }

    /// Update the tiers from the log and index entries as chunks.
    ///
    /// Without `force`, a tier is only re-prompted when at least one of its
    /// entries has not been indexed yet.
    pub async fn compact(&self, force: bool) -> Result<CompactionResult> {
        let mut result = CompactionResult::default();

        let guardrail_entries = self
            .storage
            .get_entries_by_label(&SemanticLabel::GUARDRAIL, ENTRY_LIMIT)
            .await?;
        let style_entries = self
            .storage
            .get_entries_by_label(&SemanticLabel::STYLE, ENTRY_LIMIT)
            .await?;

        if force || self.has_unindexed(&guardrail_entries).await? {
            result.guardrails_updated = self
                .update_tier(KnowledgeTier::Guardrails, GUARDRAILS_PROMPT, &guardrail_entries)
                .await?;
        }
        if force || self.has_unindexed(&style_entries).await? {
            result.style_updated = self
                .update_tier(KnowledgeTier::Style, STYLE_PROMPT, &style_entries)
                .await?;
        }
        result.recent_updated = self.update_recent().await?;

        for entry in guardrail_entries.iter().chain(&style_entries) {
            if self.index_entry(entry).await? {
                result.chunks_indexed += 1;
            }
        }

        info!(?result, "Compaction complete");
        Ok(result)
    }

    async fn has_unindexed(&self, entries: &[LogEntry]) -> Result<bool> {
        for entry in entries {
            if !self.storage.has_chunk(&entry.content, entry.label).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn update_tier(
        &self,
        tier: KnowledgeTier,
        template: &str,
        entries: &[LogEntry],
    ) -> Result<bool> {
        if entries.is_empty() {
            return Ok(false);
        }

        let current = self.files.read_tier(tier)?;
        let entries_text = entries
            .iter()
            .map(|e| format!("- [{}] {}", e.label, e.content))
            .collect::<Vec<_>>()
            .join("\n");
        let current_text = if current.trim().is_empty() { "(empty)" } else { current.as_str() };
        let prompt = template
            .replace("{current}", current_text)
            .replace("{entries}", &entries_text);

        let Some(update) = self.ask(tier, &prompt).await else {
            return Ok(false);
        };
        if update == NO_CHANGE {
            debug!(%tier, "No new knowledge");
            return Ok(false);
        }

        let combined = if current.trim().is_empty() {
            update
        } else {
            format!("{}\n\n{update}", current.trim_end())
        };
        self.write_tier(tier, &combined)?;
        Ok(true)
    }

    async fn update_recent(&self) -> Result<bool> {
        let sessions = self
            .storage
            .list_sessions(RECENT_SESSION_LIMIT, Some(SessionStatus::Completed))
            .await?;
        if sessions.is_empty() {
            return Ok(false);
        }

        let lines: Vec<String> = sessions
            .iter()
            .map(|s| {
                let date = s
                    .ended_at
                    .map(|t| t.date_naive().to_string())
                    .unwrap_or_else(|| "unknown-date".to_string());
                let summary = s.summary.as_deref().unwrap_or("No summary provided");
                format!("- {date}: task={}; summary={summary}", s.task)
            })
            .collect();
        let prompt = RECENT_PROMPT.replace("{sessions}", &lines.join("\n"));

        let Some(update) = self.ask(KnowledgeTier::Recent, &prompt).await else {
            return Ok(false);
        };
        if update.is_empty() {
            return Ok(false);
        }

        let current = self.files.read_tier(KnowledgeTier::Recent)?;
        if current.trim() == update {
            return Ok(false);
        }
        self.write_tier(KnowledgeTier::Recent, &update)?;
        Ok(true)
    }

    /// Trimmed completion, or `None` when the generator failed.
    async fn ask(&self, tier: KnowledgeTier, prompt: &str) -> Option<String> {
        match generate_text(self.generator.as_ref(), prompt, self.options).await {
            Ok(text) => Some(text.trim().to_string()),
            Err(err) => {
                warn!(%tier, error = %err, "Text generation failed, leaving tier unchanged");
                None
            }
        }
    }

    fn write_tier(&self, tier: KnowledgeTier, content: &str) -> Result<()> {
        let (merged, dropped) = canonical_tier_text(content);
        if !dropped.is_empty() {
            debug!(%tier, count = dropped.len(), lines = ?dropped, "Dropped unrecognized lines from reply");
        }
        self.files.write_tier(tier, &merged)?;
        if let Some((max_tokens, config)) = &self.token_budget {
            compact_if_over_tokens(&self.files, tier, &merged, *max_tokens, config)?;
        }
        Ok(())
    }

    async fn index_entry(&self, entry: &LogEntry) -> Result<bool> {
        let mut chunk = Chunk::new(ChunkSource::LogEntry, entry.content.clone(), entry.label)
            .with_embedding(embed_text(&entry.content, self.embedding_dimensions));
        chunk.source_ids = vec![entry.id];
        chunk.tags = entry.tags.clone();
        self.storage.store_chunk(&chunk).await
    }
}

/// Canonical tier text for `content`, plus the lines that matched no entry
/// format and were left out.
fn canonical_tier_text(content: &str) -> (String, Vec<String>) {
    let parsed = parse_tier_content(content);
    let merged = merge_tier_content(&parsed);
    (merged, parsed.unknown_lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::llm::testing::ScriptedGenerator;
    use crate::models::{LogSource, Scope, Session};
    use crate::retrieval::{RetrievalBackend, Retriever, SearchOptions};
    use crate::storage::LocalStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        storage: Arc<dyn Storage>,
        files: TierFiles,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(LocalStore::open(&dir.path().join("state.db"), Scope::default()).unwrap());
        let files = TierFiles::new(dir.path());
        Fixture { _dir: dir, storage, files }
    }

    fn engine(f: &Fixture, generator: Arc<ScriptedGenerator>) -> CompactionEngine {
        CompactionEngine::new(f.storage.clone(), f.files.clone(), generator)
    }

    #[tokio::test]
    async fn test_gotcha_is_indexed_and_searchable() {
        let f = fixture();
        let session = Session::new("configure cache");
        f.storage.create_session(&session).await.unwrap();
        let entry = LogEntry::new(
            LogSource::Explicit,
            "Redis needs REDIS_MAX_CONNECTIONS",
            SemanticLabel::Gotcha,
        )
        .with_session(session.id);
        f.storage.append_entry(&entry).await.unwrap();

        let generator = Arc::new(ScriptedGenerator::replying(&["NONE"]));
        let result = engine(&f, generator).compact(false).await.unwrap();
        assert_eq!(result.chunks_indexed, 1);
        assert!(!result.guardrails_updated);
        assert_eq!(f.storage.count_chunks().await.unwrap(), 1);

        let retriever = Retriever::new(f.storage.clone(), RetrievalConfig::default());
        let hits = retriever
            .search("redis", SearchOptions::default().backend(RetrievalBackend::Fts))
            .await
            .unwrap();
        let top = &hits[0].chunk;
        assert_eq!(top.content, "Redis needs REDIS_MAX_CONNECTIONS");
        assert_eq!(top.label, SemanticLabel::Gotcha);
        assert_eq!(top.source_ids, vec![entry.id]);
        assert!(top.embedding.is_some());
    }

    #[tokio::test]
    async fn test_reply_is_appended_to_tier() {
        let f = fixture();
        f.files
            .write_tier(KnowledgeTier::Guardrails, "# Guardrails\n\n- [GOTCHA] old rule\n")
            .unwrap();
        let entry = LogEntry::new(LogSource::Explicit, "Never skip migrations", SemanticLabel::HardFailure);
        f.storage.append_entry(&entry).await.unwrap();

        let generator = Arc::new(ScriptedGenerator::replying(&[
            "- [FAILURE] Never skip migrations, the schema drifts",
        ]));
        let result = engine(&f, generator.clone()).compact(false).await.unwrap();
        assert!(result.guardrails_updated);

        let prompt = &generator.prompts()[0];
        assert!(prompt.contains("- [hard_failure] Never skip migrations"));
        assert!(prompt.contains("- [GOTCHA] old rule"));

        assert_eq!(
            f.files.read_tier(KnowledgeTier::Guardrails).unwrap(),
            "# Guardrails\n\n- [GOTCHA] old rule\n- [FAILURE] Never skip migrations, the schema drifts\n"
        );
    }

    #[test]
    fn test_canonical_text_reports_dropped_lines() {
        let (merged, dropped) = canonical_tier_text(
            "# Guardrails\n\n- [GOTCHA] old rule\n\nSure! Here are the updates:\n- [FAILURE] new rule\nHope this helps.",
        );
        assert_eq!(merged, "# Guardrails\n\n- [GOTCHA] old rule\n- [FAILURE] new rule\n");
        assert_eq!(dropped, vec!["Sure! Here are the updates:", "Hope this helps."]);

        let (_, dropped) = canonical_tier_text("# Style\n\n- [PATTERN] keep\n");
        assert!(dropped.is_empty());
    }

    #[tokio::test]
    async fn test_reply_chatter_is_not_written() {
        let f = fixture();
        f.files
            .write_tier(KnowledgeTier::Guardrails, "# Guardrails\n\n- [GOTCHA] old rule\n")
            .unwrap();
        let entry = LogEntry::new(LogSource::Explicit, "Pin the toolchain", SemanticLabel::Gotcha);
        f.storage.append_entry(&entry).await.unwrap();

        let generator = Arc::new(ScriptedGenerator::replying(&[
            "Here is what I found:\n- [GOTCHA] Pin the toolchain",
        ]));
        let result = engine(&f, generator).compact(false).await.unwrap();
        assert!(result.guardrails_updated);
        assert_eq!(
            f.files.read_tier(KnowledgeTier::Guardrails).unwrap(),
            "# Guardrails\n\n- [GOTCHA] old rule\n- [GOTCHA] Pin the toolchain\n"
        );
    }

    #[tokio::test]
    async fn test_generator_error_leaves_tier_untouched() {
        let f = fixture();
        f.files.write_tier(KnowledgeTier::Style, "# Style\n\n- [PATTERN] keep\n").unwrap();
        let entry = LogEntry::new(LogSource::Explicit, "Prefer iterators", SemanticLabel::Preference);
        f.storage.append_entry(&entry).await.unwrap();

        let generator = Arc::new(ScriptedGenerator::new(vec![Err(anyhow::anyhow!("overloaded"))]));
        let result = engine(&f, generator).compact(false).await.unwrap();
        assert!(!result.style_updated);
        assert_eq!(result.chunks_indexed, 1);
        assert_eq!(
            f.files.read_tier(KnowledgeTier::Style).unwrap(),
            "# Style\n\n- [PATTERN] keep\n"
        );
    }

    #[tokio::test]
    async fn test_indexed_entries_are_not_reprompted() {
        let f = fixture();
        let entry = LogEntry::new(LogSource::Explicit, "Use WAL mode", SemanticLabel::Pattern);
        f.storage.append_entry(&entry).await.unwrap();

        let generator = Arc::new(ScriptedGenerator::replying(&["NONE"]));
        let engine = engine(&f, generator.clone());
        assert_eq!(engine.compact(false).await.unwrap().chunks_indexed, 1);
        assert_eq!(engine.compact(false).await.unwrap().chunks_indexed, 0);
        assert_eq!(generator.prompts().len(), 1);

        engine.compact(true).await.unwrap();
        assert_eq!(generator.prompts().len(), 2);
        assert_eq!(f.storage.count_chunks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recent_rebuilt_from_completed_sessions() {
        let f = fixture();
        let mut session = Session::new("ship parser");
        session.status = SessionStatus::Completed;
        session.ended_at = Some(chrono::Utc::now());
        session.summary = Some("parser merged".into());
        f.storage.create_session(&session).await.unwrap();

        let reply = "**2026-03-01**: Shipped the parser.";
        let generator = Arc::new(ScriptedGenerator::replying(&[reply]));
        let result = engine(&f, generator.clone()).compact(false).await.unwrap();
        assert!(result.recent_updated);
        assert!(generator.prompts()[0].contains("task=ship parser; summary=parser merged"));
        assert_eq!(
            f.files.read_tier(KnowledgeTier::Recent).unwrap(),
            format!("{reply}\n")
        );

        let generator = Arc::new(ScriptedGenerator::replying(&[reply]));
        let again = CompactionEngine::new(f.storage.clone(), f.files.clone(), generator)
            .compact(false)
            .await
            .unwrap();
        assert!(!again.recent_updated);
    }
}
