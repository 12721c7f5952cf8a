//! Climate synthesis: fold autonomous-loop iteration reports into the
//! GUARDRAILS and STYLE tiers.
//!
//! Candidates are the failure reasons, gotchas and working patterns recorded
//! in `<ralph_dir>/iterations/*.json`. They are ranked by frequency, filtered
//! against bullets already in the tier, and handed to the text generator with
//! a cap on how many bullets it may emit. When the generator yields nothing
//! usable the top candidates are written as-is.

use crate::config::AgentRecallConfig;
use crate::config::{SynthesisConfig, TierCompactionConfig};
use crate::error::Result;
use crate::llm::{GenerationOptions, TextGenerator, generate_text};
use crate::tiers::format::{ParsedEntry, merge_tier_content, parse_bullet_entry, parse_tier_content};
use crate::tiers::{KnowledgeTier, TierFiles, compact_if_over_tokens};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const GUARDRAILS_SYNTHESIS_PROMPT: &str = "You are distilling autonomous-loop iteration learnings into guardrails. \
Given the CURRENT guardrails and candidate notes, output only NEW concise bullet rules \
(1 line each), at most {max_entries} bullets. Do not repeat or paraphrase existing rules. \
Keep them actionable.

Current guardrails:
{current}

Candidates:
{candidates}";

const STYLE_SYNTHESIS_PROMPT: &str = "You are distilling autonomous-loop iteration learnings into a coding style guide. \
Given the CURRENT style guide and candidate notes, output only NEW concise bullet patterns \
(1 line each), at most {max_entries} bullets. Do not repeat or paraphrase existing patterns. \
Keep them actionable.

Current style guide:
{current}

Candidates:
{candidates}";

const STATE_FILENAME: &str = "synthesis_state.json";
const ITERATIONS_DIR: &str = "iterations";
const CURRENT_REPORT: &str = "current.json";

/// One archived loop iteration. Only the fields synthesis reads are typed;
/// everything else in the file is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationReport {
    pub iteration: Option<u32>,
    pub item_id: Option<String>,
    pub item_title: Option<String>,
    pub outcome: Option<String>,
    pub summary: Option<String>,
    pub failure_reason: Option<String>,
    pub gotcha_discovered: Option<String>,
    pub pattern_that_worked: Option<String>,
}

/// Archived reports under `<ralph_dir>/iterations`, ordered by file name.
/// Unreadable or malformed files are skipped.
pub fn load_iteration_reports(ralph_dir: &Path) -> Result<Vec<IterationReport>> {
    let dir = ralph_dir.join(ITERATIONS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != CURRENT_REPORT)
        })
        .collect();
    paths.sort();

    let reports: Vec<IterationReport> = paths
        .iter()
        .filter_map(|path| {
            let text = std::fs::read_to_string(path).ok()?;
            match serde_json::from_str(&text) {
                Ok(report) => Some(report),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "Skipping unreadable iteration report");
                    None
                }
            }
        })
        .collect();
    Ok(reports)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SynthesisState {
    last_synthesized_at: DateTime<Utc>,
    iteration_count: usize,
}

/// Candidate counts handed to each tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SynthesisSummary {
    pub guardrails: usize,
    pub style: usize,
}

/// Per-tier constants.
struct TierTarget {
    tier: KnowledgeTier,
    heading: &'static str,
    placeholder: &'static str,
    kind: &'static str,
    prompt: &'static str,
    max_entries: usize,
}

pub struct ClimateSynthesizer {
    ralph_dir: PathBuf,
    files: TierFiles,
    generator: Option<Arc<dyn TextGenerator>>,
    config: SynthesisConfig,
    max_tier_tokens: usize,
    tier_compaction: TierCompactionConfig,
    options: GenerationOptions,
}

impl ClimateSynthesizer {
    pub fn new(
        ralph_dir: impl Into<PathBuf>,
        files: TierFiles,
        generator: Option<Arc<dyn TextGenerator>>,
        config: &AgentRecallConfig,
    ) -> Self {
        Self {
            ralph_dir: ralph_dir.into(),
            files,
            generator,
            config: config.synthesis.clone(),
            max_tier_tokens: config.compaction.max_tier_tokens,
            tier_compaction: config.tier_compaction.clone(),
            options: GenerationOptions::from_config(&config.llm)
                .with_temperature(0.2)
                .with_max_tokens(800),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.ralph_dir.join(STATE_FILENAME)
    }

    /// True when the number of archived reports differs from the count
    /// recorded by the last synthesis, or no usable state exists.
    pub fn should_synthesize(&self) -> Result<bool> {
        let Ok(text) = std::fs::read_to_string(self.state_path()) else {
            return Ok(true);
        };
        let Ok(state) = serde_json::from_str::<SynthesisState>(&text) else {
            return Ok(true);
        };
        Ok(load_iteration_reports(&self.ralph_dir)?.len() != state.iteration_count)
    }

    pub async fn synthesize(&self) -> Result<SynthesisSummary> {
        let reports = load_iteration_reports(&self.ralph_dir)?;

        let guardrail_candidates = rank_candidates(
            reports
                .iter()
                .flat_map(|r| [r.failure_reason.as_deref(), r.gotcha_discovered.as_deref()])
                .flatten(),
        );
        let style_candidates =
            rank_candidates(reports.iter().filter_map(|r| r.pattern_that_worked.as_deref()));

        let guardrails = TierTarget {
            tier: KnowledgeTier::Guardrails,
            heading: "# Guardrails\n",
            placeholder: "No guardrails synthesized yet.",
            kind: "GOTCHA",
            prompt: GUARDRAILS_SYNTHESIS_PROMPT,
            max_entries: self.config.max_guardrails,
        };
        let style = TierTarget {
            tier: KnowledgeTier::Style,
            heading: "# Style Guide\n",
            placeholder: "No style patterns synthesized yet.",
            kind: "PATTERN",
            prompt: STYLE_SYNTHESIS_PROMPT,
            max_entries: self.config.max_style,
        };

        for (target, candidates) in [(guardrails, &guardrail_candidates), (style, &style_candidates)] {
            if let Some(content) = self.synthesize_tier(&target, candidates).await? {
                self.files.write_tier(target.tier, &content)?;
                compact_if_over_tokens(
                    &self.files,
                    target.tier,
                    &content,
                    self.max_tier_tokens,
                    &self.tier_compaction,
                )?;
            }
        }

        self.write_state(reports.len())?;
        let summary = SynthesisSummary {
            guardrails: guardrail_candidates.len(),
            style: style_candidates.len(),
        };
        info!(
            reports = reports.len(),
            guardrails = summary.guardrails,
            style = summary.style,
            "Climate synthesis complete"
        );
        Ok(summary)
    }

    /// New tier text, or `None` when the generator failed and the tier must
    /// stay as it is.
    async fn synthesize_tier(&self, target: &TierTarget, candidates: &[String]) -> Result<Option<String>> {
        let mut current = self.files.read_tier(target.tier)?;
        let had_content = !current.trim().is_empty();
        if !had_content {
            current = target.heading.to_string();
        }
        let unchanged = if had_content {
            current.clone()
        } else {
            format!("{}\n- {}", target.heading, target.placeholder)
        };

        let existing = existing_bullet_texts(&current);
        let novel: Vec<&String> = candidates
            .iter()
            .filter(|c| !existing.contains(&normalize_entry(c)))
            .collect();
        if novel.is_empty() {
            return Ok(Some(unchanged));
        }

        let mut synthesized = Vec::new();
        if let Some(generator) = &self.generator {
            let prompt = target
                .prompt
                .replace("{max_entries}", &target.max_entries.to_string())
                .replace("{current}", if had_content { current.trim() } else { "(empty)" })
                .replace(
                    "{candidates}",
                    &novel.iter().map(|c| format!("- {c}")).collect::<Vec<_>>().join("\n"),
                );
            match generate_text(generator.as_ref(), &prompt, self.options).await {
                Ok(reply) => {
                    synthesized = synthesized_bullets(&reply, target.kind, &existing);
                    synthesized.truncate(target.max_entries);
                }
                Err(err) => {
                    warn!(tier = %target.tier, error = %err, "Synthesis failed, leaving tier unchanged");
                    return Ok(None);
                }
            }
        }
        if synthesized.is_empty() {
            synthesized = fallback_bullets(&novel, target.kind, &existing, target.max_entries);
        }

        Ok(Some(merge_bullets(&current, &synthesized)))
    }

    fn write_state(&self, iteration_count: usize) -> Result<()> {
        let state = SynthesisState {
            last_synthesized_at: Utc::now(),
            iteration_count,
        };
        std::fs::create_dir_all(&self.ralph_dir)?;
        std::fs::write(self.state_path(), serde_json::to_string_pretty(&state)?)?;
        Ok(())
    }
}

/// Deduplicate case-insensitively, keeping the first spelling, and order by
/// (count desc, text asc).
pub fn rank_candidates<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut counts: HashMap<String, (String, usize)> = HashMap::new();
    for candidate in candidates {
        let cleaned = candidate.trim();
        if cleaned.is_empty() {
            continue;
        }
        counts
            .entry(cleaned.to_lowercase())
            .and_modify(|(_, n)| *n += 1)
            .or_insert_with(|| (cleaned.to_string(), 1));
    }
    let mut ranked: Vec<(String, usize)> = counts.into_values().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().map(|(text, _)| text).collect()
}

fn normalize_entry(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Normalized texts of the tier's bullets, plus plain `- ` lines outside
/// Ralph blocks.
fn existing_bullet_texts(content: &str) -> HashSet<String> {
    let parsed = parse_tier_content(content);
    let mut existing: HashSet<String> = parsed
        .bullet_entries
        .iter()
        .filter_map(|e| e.text.as_deref())
        .map(normalize_entry)
        .collect();

    for line in parsed.preamble.iter().chain(&parsed.unknown_lines) {
        let stripped = line.trim();
        let Some(rest) = stripped.strip_prefix("- ") else {
            continue;
        };
        let text = match parse_bullet_entry(stripped) {
            Some((_, text)) => text,
            None => rest.trim().to_string(),
        };
        if !text.is_empty() {
            existing.insert(normalize_entry(&text));
        }
    }
    existing
}

fn synthesized_bullets(reply: &str, kind: &str, existing: &HashSet<String>) -> Vec<String> {
    let mut seen = existing.clone();
    let mut bullets = Vec::new();
    for line in reply.lines().map(str::trim) {
        let Some(rest) = line.strip_prefix("- ") else {
            continue;
        };
        let text = parse_bullet_entry(line)
            .map(|(_, text)| text)
            .unwrap_or_else(|| rest.trim().to_string());
        let normalized = normalize_entry(&text);
        if normalized.is_empty() || !seen.insert(normalized) {
            continue;
        }
        bullets.push(format!("- [{kind}] {text}"));
    }
    bullets
}

fn fallback_bullets(
    candidates: &[&String],
    kind: &str,
    existing: &HashSet<String>,
    max_entries: usize,
) -> Vec<String> {
    let mut seen = existing.clone();
    candidates
        .iter()
        .filter(|c| {
            let normalized = normalize_entry(c);
            !normalized.is_empty() && seen.insert(normalized)
        })
        .take(max_entries)
        .map(|c| format!("- [{kind}] {}", c.trim()))
        .collect()
}

fn merge_bullets(current: &str, bullets: &[String]) -> String {
    if bullets.is_empty() {
        return current.to_string();
    }
    let mut parsed = parse_tier_content(current);
    parsed.bullet_entries.extend(
        bullets
            .iter()
            .filter_map(|line| parse_bullet_entry(line))
            .map(|(kind, text)| ParsedEntry::bullet(&kind, &text)),
    );
    merge_tier_content(&parsed)
}
