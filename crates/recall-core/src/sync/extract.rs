//! LLM-backed learning extraction from normalized transcripts.

use crate::ingest::{LearningExtractor, RawMessage, RawSession};
use crate::llm::{GenerationOptions, TextGenerator, generate_text};
use crate::models::{LogEntry, LogSource, SemanticLabel};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::debug;

const EXTRACTION_SYSTEM_PROMPT: &str = "You are analyzing a development session transcript
to extract learnings that will help future AI agents working on this codebase.

Your job is to identify valuable insights in these categories:

1. hard_failure: Things that definitively broke or didn't work
2. gotcha: Non-obvious issues or quirks discovered
3. correction: When the user corrected the agent's approach
4. preference: Implicit or explicit team/codebase preferences
5. pattern: Useful patterns that worked well
6. decision: Significant architectural or design decisions with rationale

RULES:
- Focus on knowledge that helps future agents avoid mistakes or work more effectively
- Be specific and actionable
- Include the \"why\" when possible
- Do not extract routine operations
- Do not extract workflow/process instructions (task status updates, ticket/plan handling)
- Never include chain-of-thought, reasoning traces, or commentary in output
- If there are no meaningful learnings, return an empty array

For confidence scoring:
- High (0.9): Explicit statement or direct feedback
- Medium (0.7): Inferred from behavior or context
- Low (0.5): Tentative observation";

const EXTRACTION_OUTPUT_INSTRUCTIONS: &str = r#"Output as a JSON array. Each item must have:
{
  "label": "<hard_failure|gotcha|correction|preference|pattern|decision>",
  "content": "<concise, actionable description>",
  "tags": ["<relevant>", "<tags>"],
  "confidence": <0.5-1.0>,
  "evidence": "<brief quote or reference>"
}

If there are no meaningful learnings, output exactly: []
Do not include markdown fences, prose, or thinking tags.
Return only raw JSON.

JSON array:"#;

/// Transcript size sent per batch, in characters.
const MAX_TRANSCRIPT_CHARS: usize = 5_000;
/// Batches shorter than this carry nothing worth a model call.
const MIN_TRANSCRIPT_CHARS: usize = 200;
const MAX_ARGS_CHARS: usize = 200;
const MAX_RESULT_CHARS: usize = 300;
const DEFAULT_CONFIDENCE: f64 = 0.7;

const EMPTY_MARKERS: [&str; 5] = ["[]", "", "NONE", "None", "null"];
const WRAPPER_KEYS: [&str; 5] = ["learnings", "entries", "items", "results", "data"];
const BLOCKED_PHRASES: [&str; 11] = [
    "do not modify plan",
    "don't modify plan",
    "do not edit plan",
    "in_progress",
    "todo",
    "to-do",
    "ticket",
    "jira",
    "workflow",
    "process step",
    "project management",
];

static REASONING_TAGS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)<\s*(think|analysis|reasoning)[^>]*>[\s\S]*?<\s*/\s*(think|analysis|reasoning)\s*>",
    )
    .ok()
});

static CODE_FENCE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)```(?:json)?").ok());

/// Extracts labeled learnings by prompting a [`TextGenerator`] once per
/// message batch.
pub struct TranscriptExtractor {
    generator: Arc<dyn TextGenerator>,
    messages_per_batch: usize,
    options: GenerationOptions,
}

impl TranscriptExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            messages_per_batch: 100,
            options: GenerationOptions::default()
                .with_temperature(0.1)
                .with_max_tokens(700),
        }
    }

    pub fn with_messages_per_batch(mut self, messages_per_batch: usize) -> Self {
        self.messages_per_batch = messages_per_batch.max(1);
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    fn build_prompt(
        &self,
        session: &RawSession,
        transcript: &str,
        batch_index: usize,
        batch_count: usize,
    ) -> String {
        let project = session
            .project_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "{EXTRACTION_SYSTEM_PROMPT}\n\n\
             Analyze this development session transcript and extract learnings.\n\n\
             Session source: {source}\n\
             Project: {project}\n\
             Date: {date}\n\
             Duration: {duration}\n\
             Segment: batch {batch_index}/{batch_count}\n\n\
             === TRANSCRIPT START ===\n{transcript}\n=== TRANSCRIPT END ===\n\n\
             {EXTRACTION_OUTPUT_INSTRUCTIONS}",
            source = session.source,
            date = session.started_at.format("%Y-%m-%d %H:%M"),
            duration = session.duration_label(),
        )
    }
}

#[async_trait]
impl LearningExtractor for TranscriptExtractor {
    async fn extract(&self, session: &RawSession) -> anyhow::Result<Vec<LogEntry>> {
        if session.messages.len() < 2 {
            return Ok(Vec::new());
        }

        let batches: Vec<&[RawMessage]> = session.messages.chunks(self.messages_per_batch).collect();
        let batch_count = batches.len();
        let mut entries = Vec::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let transcript = format_transcript(batch, MAX_TRANSCRIPT_CHARS);
            if transcript.chars().count() < MIN_TRANSCRIPT_CHARS {
                continue;
            }

            let prompt = self.build_prompt(session, &transcript, index + 1, batch_count);
            let response = generate_text(self.generator.as_ref(), &prompt, self.options).await?;
            let batch_entries = parse_response(&response, session);
            debug!(
                session_id = %session.session_id,
                batch = index + 1,
                batch_count,
                learnings = batch_entries.len(),
                "Extraction batch complete"
            );
            entries.extend(batch_entries);
        }

        Ok(dedupe_entries(entries))
    }
}

/// Render messages as a readable transcript, middle-truncated to `max_chars`.
pub fn format_transcript(messages: &[RawMessage], max_chars: usize) -> String {
    let mut lines: Vec<String> = Vec::new();

    for message in messages {
        let ts = message
            .timestamp
            .map(|t| format!(" [{}]", t.format("%H:%M")))
            .unwrap_or_default();
        let role = if message.is_user() { "USER" } else { "ASSISTANT" };
        lines.push(format!("### {role}{ts}"));
        lines.push(String::new());
        lines.push(message.content.clone());

        for call in &message.tool_calls {
            let status = if call.success { "OK" } else { "ERR" };
            lines.push(format!("\n  -> Tool: {} {status}", call.tool));
            if !call.args.is_empty() {
                let args = Value::Object(call.args.clone()).to_string();
                lines.push(format!("    Args: {}", truncate_with_ellipsis(&args, MAX_ARGS_CHARS)));
            }
            if let Some(result) = call.result.as_deref().filter(|r| !r.is_empty()) {
                lines.push(format!(
                    "    Result: {}",
                    truncate_with_ellipsis(result, MAX_RESULT_CHARS)
                ));
            }
        }

        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());
    }

    let transcript = lines.join("\n");
    let total = transcript.chars().count();
    if total <= max_chars {
        return transcript;
    }

    let keep_each = max_chars.saturating_sub(100) / 2;
    let head: String = transcript.chars().take(keep_each).collect();
    let tail: String = transcript.chars().skip(total - keep_each).collect();
    format!("{head}\n\n[... middle of session truncated for length ...]\n\n{tail}")
}

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}...")
}

/// Strip reasoning tags and code fences from a model reply.
pub fn sanitize_response(response: &str) -> String {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut cleaned = trimmed.to_string();
    if let Some(re) = REASONING_TAGS.as_ref() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    if let Some(re) = CODE_FENCE.as_ref() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    cleaned.trim().to_string()
}

/// Parse a model reply into extracted entries. Malformed items are skipped.
pub fn parse_response(response: &str, session: &RawSession) -> Vec<LogEntry> {
    let cleaned = sanitize_response(response);
    if EMPTY_MARKERS.contains(&cleaned.as_str()) {
        return Vec::new();
    }
    let Some(items) = parse_learnings(&cleaned) else {
        debug!(session_id = %session.session_id, "Extraction reply was not a JSON array");
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.as_object())
        .filter_map(|item| build_entry(item, session))
        .collect()
}

fn parse_learnings(text: &str) -> Option<Vec<Value>> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return unwrap_learnings(value);
    }
    json_candidates(text)
        .into_iter()
        .filter_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .find_map(unwrap_learnings)
}

fn unwrap_learnings(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => WRAPPER_KEYS.iter().find_map(|key| match map.remove(*key) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        }),
        _ => None,
    }
}

/// Balanced `[...]` segments first, then `{...}` segments, in text order.
fn json_candidates(text: &str) -> Vec<&str> {
    let mut candidates = balanced_segments(text, b'[', b']');
    candidates.extend(balanced_segments(text, b'{', b'}'));
    candidates
}

fn balanced_segments(text: &str, open: u8, close: u8) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();

    for start in (0..bytes.len()).filter(|&i| bytes[i] == open) {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (idx, &byte) in bytes.iter().enumerate().skip(start) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if byte == b'\\' {
                    escaped = true;
                } else if byte == b'"' {
                    in_string = false;
                }
                continue;
            }
            if byte == b'"' {
                in_string = true;
            } else if byte == open {
                depth += 1;
            } else if byte == close {
                depth -= 1;
                if depth == 0 {
                    segments.push(&text[start..=idx]);
                    break;
                }
            }
        }
    }
    segments
}

fn build_entry(item: &serde_json::Map<String, Value>, session: &RawSession) -> Option<LogEntry> {
    let content = value_text(item.get("content"))?.trim().to_string();
    let label_raw = value_text(item.get("label"))?.trim().to_lowercase();
    if content.is_empty() || label_raw.is_empty() || !is_functional_learning(&content) {
        return None;
    }

    let tags = match item.get("tags") {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| value_text(Some(v)))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => value_text(Some(other))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .into_iter()
            .collect(),
    };

    let confidence = match item.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_CONFIDENCE),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_CONFIDENCE),
        _ => DEFAULT_CONFIDENCE,
    }
    .clamp(0.0, 1.0);

    let evidence = value_text(item.get("evidence")).unwrap_or_default();

    let mut entry = LogEntry::new(LogSource::Extracted, content, resolve_label(&label_raw))
        .with_tags(tags)
        .with_confidence(confidence)
        .with_source_session(session.session_id.clone());
    entry.metadata.insert("evidence".into(), Value::String(evidence));
    entry
        .metadata
        .insert("source_tool".into(), Value::String(session.source.clone()));
    entry
        .metadata
        .insert("extracted_at".into(), Value::String(Utc::now().to_rfc3339()));

    entry.validate().ok()?;
    Some(entry)
}

fn value_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn is_functional_learning(content: &str) -> bool {
    let lowered = content.to_lowercase();
    !BLOCKED_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

fn resolve_label(raw: &str) -> SemanticLabel {
    if let Ok(label) = raw.parse() {
        return label;
    }
    match raw {
        "failure" | "error" => SemanticLabel::HardFailure,
        "warning" => SemanticLabel::Gotcha,
        "style" => SemanticLabel::Preference,
        _ => SemanticLabel::Pattern,
    }
}

fn dedupe_entries(entries: Vec<LogEntry>) -> Vec<LogEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert((e.label, e.content.trim().to_lowercase())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::RawToolCall;
    use crate::llm::testing::ScriptedGenerator;

    fn session_with(messages: Vec<RawMessage>) -> RawSession {
        RawSession::new("claude-code", "claude-code-abc").with_messages(messages)
    }

    fn long_session() -> RawSession {
        session_with(vec![
            RawMessage::user(format!("Please fix the redis pool. {}", "context ".repeat(20))),
            RawMessage::assistant(format!("Raised REDIS_MAX_CONNECTIONS. {}", "details ".repeat(20))),
        ])
    }

    #[test]
    fn test_format_transcript_tool_calls() {
        let mut call = RawToolCall::new("Bash");
        call.args.insert("command".into(), Value::String("x".repeat(500)));
        call.result = Some("y".repeat(400));
        call.success = false;
        let mut message = RawMessage::assistant("running tests");
        message.tool_calls.push(call);

        let transcript = format_transcript(&[RawMessage::user("hello"), message], 50_000);
        assert!(transcript.starts_with("### USER\n\nhello\n\n---\n\n### ASSISTANT"));
        assert!(transcript.contains("\n  -> Tool: Bash ERR"));
        let args_line = transcript.lines().find(|l| l.starts_with("    Args: ")).unwrap();
        assert_eq!(args_line.chars().count(), "    Args: ".len() + MAX_ARGS_CHARS + 3);
        assert!(args_line.ends_with("..."));
        assert!(transcript.contains(&format!("    Result: {}...", "y".repeat(300))));
    }

    #[test]
    fn test_format_transcript_truncates_middle() {
        let messages: Vec<_> = (0..200)
            .map(|i| RawMessage::user(format!("message number {i} with some padding text")))
            .collect();
        let transcript = format_transcript(&messages, MAX_TRANSCRIPT_CHARS);
        assert!(transcript.contains("[... middle of session truncated for length ...]"));
        assert!(transcript.starts_with("### USER"));
        assert!(transcript.chars().count() <= MAX_TRANSCRIPT_CHARS);
    }

    #[test]
    fn test_sanitize_response() {
        let raw = "<think>hmm, maybe</think>\n```json\n[{\"label\": \"gotcha\"}]\n```";
        assert_eq!(sanitize_response(raw), "[{\"label\": \"gotcha\"}]");
        assert_eq!(sanitize_response("  "), "");
    }

    #[test]
    fn test_parse_response_variants() {
        let session = long_session();
        assert!(parse_response("NONE", &session).is_empty());
        assert!(parse_response("[]", &session).is_empty());

        let wrapped = r#"{"learnings": [{"label": "gotcha", "content": "Pool exhausts at 10"}]}"#;
        assert_eq!(parse_response(wrapped, &session).len(), 1);

        let prose = r#"Here you go: [{"label": "pattern", "content": "Use pooled clients"}] done"#;
        let entries = parse_response(prose, &session);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label, SemanticLabel::Pattern);

        assert!(parse_response("not json at all", &session).is_empty());
    }

    #[test]
    fn test_build_entry_fields() {
        let session = long_session();
        let reply = r#"[
            {"label": "Warning", "content": "Redis needs REDIS_MAX_CONNECTIONS",
             "tags": ["Redis", " "], "confidence": 1.7, "evidence": "log line"},
            {"label": "tip", "content": "Update the JIRA ticket first"},
            {"label": "decision", "content": ""},
            "just a string"
        ]"#;
        let entries = parse_response(reply, &session);
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.label, SemanticLabel::Gotcha);
        assert_eq!(entry.source, LogSource::Extracted);
        assert_eq!(entry.source_session_id.as_deref(), Some("claude-code-abc"));
        assert_eq!(entry.tags, vec!["redis".to_string()]);
        assert_eq!(entry.confidence, 1.0);
        assert_eq!(entry.metadata["evidence"], "log line");
        assert_eq!(entry.metadata["source_tool"], "claude-code");
    }

    #[test]
    fn test_resolve_label_fallbacks() {
        assert_eq!(resolve_label("decision"), SemanticLabel::DecisionRationale);
        assert_eq!(resolve_label("error"), SemanticLabel::HardFailure);
        assert_eq!(resolve_label("style"), SemanticLabel::Preference);
        assert_eq!(resolve_label("whatever"), SemanticLabel::Pattern);
    }

    #[tokio::test]
    async fn test_extract_dedupes_across_batches() {
        let reply = r#"[{"label": "gotcha", "content": "Redis needs REDIS_MAX_CONNECTIONS"}]"#;
        let generator = Arc::new(ScriptedGenerator::replying(&[reply, reply]));
        let extractor = TranscriptExtractor::new(generator.clone()).with_messages_per_batch(2);

        let mut messages = long_session().messages;
        messages.extend(long_session().messages);
        let entries = extractor.extract(&session_with(messages)).await.unwrap();

        assert_eq!(generator.prompts().len(), 2);
        assert!(generator.prompts()[1].contains("Segment: batch 2/2"));
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_extract_skips_tiny_sessions() {
        let generator = Arc::new(ScriptedGenerator::replying(&["[]"]));
        let extractor = TranscriptExtractor::new(generator.clone());

        let single = session_with(vec![RawMessage::user("hi")]);
        assert!(extractor.extract(&single).await.unwrap().is_empty());

        let short = session_with(vec![RawMessage::user("hi"), RawMessage::assistant("hello")]);
        assert!(extractor.extract(&short).await.unwrap().is_empty());
        assert!(generator.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_extract_propagates_generator_errors() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(anyhow::anyhow!("boom"))]));
        let extractor = TranscriptExtractor::new(generator);
        let err = extractor.extract(&long_session()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
