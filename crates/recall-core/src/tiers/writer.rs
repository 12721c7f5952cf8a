//! Policy-driven writes of loop iteration entries into tier files.
//!
//! Entries are `## <timestamp> Iteration <n> (<item>)` blocks. Every write
//! goes through the same path: ensure the tier header, skip duplicates,
//! append within the entry bound (or replace a section), validate against
//! the tier's section schema, then write the file atomically.

use super::{KnowledgeTier, TierFiles};
use crate::embedding::content_hash;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

/// Entry bound when neither the policy nor the schema names one.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Where per-iteration agent and validation logs live.
pub const DEFAULT_RUNTIME_DIR: &str = "agent_recall/ralph/.runtime";

const MAX_REPORTED_ERRORS: usize = 6;
const LOW_SIGNAL_CHARS: usize = 20;
const LOW_SIGNAL_LOOKAHEAD: usize = 9;

static ITERATION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Iteration\s+(?P<iter>\d+)\s+\((?P<item>[^)]+)\)").ok());

static TIMESTAMP_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^##\s+(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z)").ok());

static HEADER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^#\s+\w+").ok());

static SECTION_HEADER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^##\s+\S").ok());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    #[default]
    Append,
    ReplaceSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePolicy {
    pub mode: WriteMode,
    pub deduplicate: bool,
    pub max_entries: Option<usize>,
    /// Section replaced in `ReplaceSection` mode; a schema section name or
    /// text that appears in the section heading. Defaults to the section the
    /// entry kind belongs to.
    pub section_target: Option<String>,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            mode: WriteMode::Append,
            deduplicate: true,
            max_entries: None,
            section_target: None,
        }
    }
}

/// One section a tier file may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionSchema {
    pub name: &'static str,
    /// Case-insensitive pattern matched against a whole line.
    pub pattern: &'static str,
    pub required: bool,
    pub max_entries: Option<usize>,
}

impl SectionSchema {
    fn matcher(&self) -> Option<Regex> {
        Regex::new(&format!("(?i){}", self.pattern)).ok()
    }

    fn matches(&self, line: &str) -> bool {
        self.matcher().is_some_and(|re| re.is_match(line))
    }
}

const GUARDRAILS_SCHEMA: &[SectionSchema] = &[
    SectionSchema { name: "header", pattern: r"^#\s+Guardrails", required: true, max_entries: None },
    SectionSchema {
        name: "hard_failure",
        pattern: r"^##\s+.*HARD FAILURE.*",
        required: false,
        max_entries: Some(50),
    },
    SectionSchema { name: "general", pattern: r"^##\s+.*", required: false, max_entries: Some(100) },
];

const STYLE_SCHEMA: &[SectionSchema] = &[
    SectionSchema { name: "header", pattern: r"^#\s+Style", required: true, max_entries: None },
    SectionSchema {
        name: "iteration",
        pattern: r"^##\s+.*Iteration.*",
        required: false,
        max_entries: Some(100),
    },
    SectionSchema { name: "general", pattern: r"^##\s+.*", required: false, max_entries: Some(100) },
];

const RECENT_SCHEMA: &[SectionSchema] = &[
    SectionSchema { name: "header", pattern: r"^#\s+Recent", required: true, max_entries: None },
    SectionSchema {
        name: "iteration",
        pattern: r"^##\s+.*Iteration.*",
        required: false,
        max_entries: Some(50),
    },
];

pub fn tier_schema(tier: KnowledgeTier) -> &'static [SectionSchema] {
    match tier {
        KnowledgeTier::Guardrails => GUARDRAILS_SCHEMA,
        KnowledgeTier::Style => STYLE_SCHEMA,
        KnowledgeTier::Recent => RECENT_SCHEMA,
    }
}

/// Header written into an empty or headerless tier.
pub fn tier_header(tier: KnowledgeTier) -> &'static str {
    tier.default_header()
}

/// Facts about one loop iteration shared by every entry kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationContext {
    pub iteration: u32,
    pub item_id: String,
    pub item_title: String,
    pub validation_hint: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl IterationContext {
    pub fn new(iteration: u32, item_id: impl Into<String>, item_title: impl Into<String>) -> Self {
        Self {
            iteration,
            item_id: item_id.into(),
            item_title: item_title.into(),
            validation_hint: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_validation_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        self.validation_hint = (!hint.trim().is_empty()).then_some(hint);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn stamp(&self) -> String {
        self.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// How an iteration ended, for the RECENT tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    pub work_mode: String,
    pub agent_exit: i32,
    pub validate_status: String,
    pub outcome: String,
}

#[derive(Debug, Clone)]
pub struct TierWriter {
    files: TierFiles,
    policy: WritePolicy,
    validation_command: Option<String>,
    runtime_dir: String,
}

impl TierWriter {
    pub fn new(files: TierFiles) -> Self {
        Self {
            files,
            policy: WritePolicy::default(),
            validation_command: None,
            runtime_dir: DEFAULT_RUNTIME_DIR.to_string(),
        }
    }

    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Command quoted in hard-failure and style entries.
    pub fn with_validation_command(mut self, command: impl Into<String>) -> Self {
        self.validation_command = Some(command.into());
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<String>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn policy(&self) -> &WritePolicy {
        &self.policy
    }

    /// Guardrail for an iteration that did not land. `reason` selects the
    /// advice line (`validation_failed`, `agent_timeout`, `abort`).
    pub fn write_guardrails_entry(&self, ctx: &IterationContext, reason: &str) -> Result<bool> {
        let mut lines = vec![
            format!("## {} Iteration {} ({})", ctx.stamp(), ctx.iteration, ctx.item_id),
            format!("- Scope item: {}", ctx.item_title),
        ];
        lines.push(
            match reason {
                "validation_failed" => "- Do not move to a new PRD item while validation is red.",
                "agent_timeout" => {
                    "- Agent exceeded iteration timeout; reduce scope and keep commits smaller."
                }
                "abort" => "- Abort means scope exceeded safety; reduce change size next iteration.",
                _ => "- Keep changes isolated and verifiable before commit.",
            }
            .to_string(),
        );
        if let Some(hint) = &ctx.validation_hint {
            lines.push(format!("- Runtime validation signal: {hint}"));
        }
        lines.push(self.runtime_logs(ctx.iteration));

        self.write_entry(KnowledgeTier::Guardrails, &lines.join("\n"), "general")
    }

    /// Guardrail for an iteration whose validation failed outright. Only the
    /// first few errors are kept.
    pub fn write_guardrails_hard_failure(
        &self,
        ctx: &IterationContext,
        validation_errors: &[String],
    ) -> Result<bool> {
        let mut lines = vec![
            format!(
                "## {} HARD FAILURE Iteration {} ({})",
                ctx.stamp(),
                ctx.iteration,
                ctx.item_id
            ),
            format!("- Item: {}", ctx.item_title),
        ];
        if let Some(command) = &self.validation_command {
            lines.push(format!("- Validation command: {command}"));
        }
        if validation_errors.is_empty() {
            lines.push("- Validation failed without captured output.".to_string());
        } else {
            lines.push("- Top validation errors:".to_string());
            lines.extend(
                validation_errors
                    .iter()
                    .take(MAX_REPORTED_ERRORS)
                    .map(|e| format!("  - {e}")),
            );
        }
        if let Some(hint) = &ctx.validation_hint {
            lines.push(format!("- Primary actionable signal: {hint}"));
        }
        lines.push(self.runtime_logs(ctx.iteration));

        self.write_entry(KnowledgeTier::Guardrails, &lines.join("\n"), "hard_failure")
    }

    pub fn write_style_entry(&self, ctx: &IterationContext) -> Result<bool> {
        let mut lines = vec![
            format!("## {} Iteration {} ({})", ctx.stamp(), ctx.iteration, ctx.item_id),
            "- Prefer one logical change per commit.".to_string(),
        ];
        if let Some(command) = &self.validation_command {
            lines.push(format!("- Keep validation command green before committing: {command}"));
        }
        lines.push(match &ctx.validation_hint {
            Some(hint) => format!("- Start debugging from the first actionable validation line: {hint}"),
            None => "- Keep runtime validate logs concise so the first actionable line is obvious."
                .to_string(),
        });
        lines.push(self.runtime_logs(ctx.iteration));

        self.write_entry(KnowledgeTier::Style, &lines.join("\n"), "iteration")
    }

    pub fn write_recent_entry(&self, ctx: &IterationContext, outcome: &IterationOutcome) -> Result<bool> {
        let mut lines = vec![
            format!("## {} Iteration {}", ctx.stamp(), ctx.iteration),
            format!("- Item: {} - {}", ctx.item_id, ctx.item_title),
            format!("- Mode: {}", outcome.work_mode),
            format!("- Agent exit code: {}", outcome.agent_exit),
            format!("- Validation: {}", outcome.validate_status),
            format!("- Outcome: {}", outcome.outcome),
        ];
        if let Some(hint) = &ctx.validation_hint {
            lines.push(format!("- Validation signal: {hint}"));
        }
        lines.push(self.runtime_logs(ctx.iteration));

        self.write_entry(KnowledgeTier::Recent, &lines.join("\n"), "iteration")
    }

    /// Write `entry` under the configured policy. Returns `false` when the
    /// entry was skipped as a duplicate.
    pub fn write_entry(&self, tier: KnowledgeTier, entry: &str, section: &str) -> Result<bool> {
        let current = ensure_header(tier, &self.files.read_tier(tier)?);

        if self.policy.deduplicate && is_duplicate(&current, entry) {
            debug!(%tier, "Skipping duplicate tier entry");
            return Ok(false);
        }

        let updated = match self.policy.mode {
            WriteMode::ReplaceSection => {
                let target = self.policy.section_target.as_deref().unwrap_or(section);
                replace_section(tier, &current, entry, target)
            }
            WriteMode::Append => bounded_append(&current, entry, self.entry_limit(tier)),
        };

        let errors = validate_tier_content(tier, &updated, self.policy.max_entries);
        if !errors.is_empty() {
            return Err(Error::Validation(format!(
                "tier {tier} failed validation: {}",
                errors.join(", ")
            )));
        }

        self.files.write_tier(tier, &updated)?;
        Ok(true)
    }

    /// Errors `tier` content would raise on the next write.
    pub fn validate_tier_content(&self, tier: KnowledgeTier, content: &str) -> Vec<String> {
        validate_tier_content(tier, content, self.policy.max_entries)
    }

    fn entry_limit(&self, tier: KnowledgeTier) -> usize {
        self.policy.max_entries.unwrap_or_else(|| schema_limit(tier))
    }

    fn runtime_logs(&self, iteration: u32) -> String {
        format!(
            "- Runtime logs: {dir}/agent-{iteration}.log, {dir}/validate-{iteration}.log",
            dir = self.runtime_dir
        )
    }
}

fn schema_limit(tier: KnowledgeTier) -> usize {
    tier_schema(tier)
        .iter()
        .find_map(|s| s.max_entries)
        .unwrap_or(DEFAULT_MAX_ENTRIES)
}

fn is_entry_header(line: &str) -> bool {
    line.starts_with("## ")
}

/// `content` with the tier header in front, or just the header when empty.
pub fn ensure_header(tier: KnowledgeTier, content: &str) -> String {
    let header = tier_header(tier);
    if content.trim().is_empty() {
        return header.to_string();
    }
    let first_line = header.lines().next().unwrap_or_default();
    if content.trim_start().starts_with(first_line) {
        content.to_string()
    } else {
        format!("{header}\n{content}")
    }
}

fn dedup_hash(text: &str) -> String {
    content_hash(&text.to_lowercase())
}

fn iteration_key(line: &str) -> Option<(String, String)> {
    let caps = ITERATION_RE.as_ref()?.captures(line)?;
    Some((caps["iter"].to_string(), caps["item"].to_string()))
}

/// Existing `## ` blocks of `content`, header line included.
fn entry_blocks(content: &str) -> Vec<String> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    for line in content.lines() {
        if is_entry_header(line) {
            blocks.push(vec![line]);
        } else if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }
    blocks.into_iter().map(|b| b.join("\n")).collect()
}

/// True when `entry` already exists in `current`: same text up to case and
/// whitespace (as a whole block or a single line), or the same iteration
/// number and item id.
pub fn is_duplicate(current: &str, entry: &str) -> bool {
    let hash = dedup_hash(entry);
    if current.lines().any(|line| dedup_hash(line) == hash) {
        return true;
    }
    if entry_blocks(current).iter().any(|block| dedup_hash(block) == hash) {
        return true;
    }

    let Some(key) = entry.lines().find(|l| is_entry_header(l)).and_then(iteration_key) else {
        return false;
    };
    current
        .lines()
        .filter(|l| is_entry_header(l))
        .filter_map(iteration_key)
        .any(|existing| existing == key)
}

/// Append `entry`, dropping the oldest `## ` blocks so at most
/// `max_entries` remain afterwards.
pub fn bounded_append(current: &str, entry: &str, max_entries: usize) -> String {
    let entry_count = current.lines().filter(|l| is_entry_header(l)).count();
    let to_remove = (entry_count + 1).saturating_sub(max_entries.max(1));

    let kept = if to_remove == 0 {
        current.to_string()
    } else {
        debug!(removed = to_remove, "Dropping oldest tier entries");
        let mut lines = Vec::new();
        let mut removed = 0;
        let mut skipping = false;
        for line in current.lines() {
            if is_entry_header(line) {
                skipping = removed < to_remove;
                if skipping {
                    removed += 1;
                }
            }
            if !skipping {
                lines.push(line);
            }
        }
        lines.join("\n")
    };

    format!("{}\n\n{}\n", kept.trim_end(), entry.trim())
}

/// Swap the first section matching `target` for `entry`; append when no
/// section matches.
fn replace_section(tier: KnowledgeTier, current: &str, entry: &str, target: &str) -> String {
    let matcher = tier_schema(tier)
        .iter()
        .find(|s| s.name == target)
        .and_then(SectionSchema::matcher)
        .or_else(|| Regex::new(&format!(r"(?i)^##\s+.*{}.*", regex::escape(target))).ok());

    let lines: Vec<&str> = current.lines().collect();
    let start = matcher.and_then(|re| lines.iter().position(|l| is_entry_header(l) && re.is_match(l)));
    let Some(start) = start else {
        return format!("{}\n\n{}\n", current.trim_end(), entry.trim());
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| is_entry_header(l))
        .map(|offset| start + 1 + offset);

    let mut out: Vec<&str> = lines[..start].to_vec();
    out.extend(entry.trim().lines());
    if let Some(end) = end {
        out.push("");
        out.extend(&lines[end..]);
    }
    format!("{}\n", out.join("\n").trim_end())
}

/// Schema violations in `content`: missing required sections, empty section
/// headings, and more entries than allowed. `max_entries` overrides the
/// schema bound.
pub fn validate_tier_content(tier: KnowledgeTier, content: &str, max_entries: Option<usize>) -> Vec<String> {
    let schema = tier_schema(tier);
    let lines: Vec<&str> = content.lines().collect();
    let mut errors = Vec::new();

    for section in schema.iter().filter(|s| s.required) {
        if !lines.iter().any(|l| section.matches(l)) {
            errors.push(format!("Missing required section: {}", section.name));
        }
    }

    let well_formed = SECTION_HEADER_RE.as_ref();
    for (i, line) in lines.iter().enumerate() {
        if is_entry_header(line) && !well_formed.is_some_and(|re| re.is_match(line)) {
            errors.push(format!("Line {}: Malformed section header (missing content)", i + 1));
        }
    }

    let entry_count = lines.iter().filter(|l| is_entry_header(l)).count();
    let bound = match max_entries {
        Some(limit) => Some(("policy", limit)),
        None => schema.iter().find_map(|s| s.max_entries.map(|m| (s.name, m))),
    };
    if let Some((name, limit)) = bound.filter(|(_, limit)| entry_count > *limit) {
        errors.push(format!(
            "Entry count ({entry_count}) exceeds maximum ({limit}) for section {name}"
        ));
    }

    errors
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LintReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl LintReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Lint tier text. Schema violations are warnings unless `strict`, which
/// also turns every warning into an error.
pub fn lint_tier_file(tier: KnowledgeTier, content: &str, strict: bool) -> LintReport {
    let mut report = LintReport::default();
    if content.trim().is_empty() {
        report.errors.push("Tier file is empty".to_string());
        return report;
    }

    let lines: Vec<&str> = content.lines().collect();
    let has_header = HEADER_RE
        .as_ref()
        .is_some_and(|re| lines.iter().any(|l| re.is_match(l)));
    if !has_header {
        report
            .errors
            .push("Missing required header (e.g., '# Guardrails')".to_string());
    }

    for (i, line) in lines.iter().enumerate() {
        if !is_entry_header(line) {
            continue;
        }
        let body: usize = lines[i + 1..]
            .iter()
            .take(LOW_SIGNAL_LOOKAHEAD)
            .take_while(|l| !is_entry_header(l))
            .map(|l| l.trim().len())
            .sum();
        if body < LOW_SIGNAL_CHARS {
            report
                .warnings
                .push(format!("Line {}: Low-signal entry (very short content)", i + 1));
        }
        if let Some(ts) = header_timestamp(line).filter(|ts| parse_timestamp(ts).is_none()) {
            report
                .warnings
                .push(format!("Line {}: Malformed timestamp: {ts}", i + 1));
        }
    }

    for error in validate_tier_content(tier, content, None) {
        if strict {
            report.errors.push(error);
        } else {
            report.warnings.push(error);
        }
    }

    if strict {
        report.errors.append(&mut report.warnings);
    }
    report
}

fn header_timestamp(line: &str) -> Option<&str> {
    let caps = TIMESTAMP_RE.as_ref()?.captures(line)?;
    caps.name("ts").map(|m| m.as_str())
}

fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts).ok().map(|t| t.with_timezone(&Utc))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStatistics {
    pub entry_count: usize,
    /// Characters on non-blank lines that are not headings.
    pub content_size: usize,
    pub line_count: usize,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

pub fn get_tier_statistics(content: &str) -> TierStatistics {
    let lines: Vec<&str> = content.split('\n').collect();
    let timestamps: Vec<DateTime<Utc>> = lines
        .iter()
        .filter_map(|l| header_timestamp(l))
        .filter_map(parse_timestamp)
        .collect();

    TierStatistics {
        entry_count: lines.iter().filter(|l| is_entry_header(l)).count(),
        content_size: lines
            .iter()
            .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .map(|l| l.len())
            .sum(),
        line_count: lines.len(),
        earliest: timestamps.iter().min().copied(),
        latest: timestamps.iter().max().copied(),
    }
}
