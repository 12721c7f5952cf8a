//! Post-loop tier compaction: dedup, size budget and summarization of Ralph
//! blocks, plus bullet dedup.

use super::format::{ParsedEntry, TierContent, merge_tier_content, parse_tier_content};
use super::{KnowledgeTier, TierFiles};
use crate::config::TierCompactionConfig;
use crate::embedding::{content_hash, normalize_content};
use crate::error::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierCompactionResult {
    pub tier: KnowledgeTier,
    pub entries_before: usize,
    pub entries_after: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub duplicates_removed: usize,
    pub entries_dropped: usize,
    pub entries_summarized: usize,
}

impl TierCompactionResult {
    fn empty(tier: KnowledgeTier, bytes_before: usize) -> Self {
        Self {
            tier,
            entries_before: 0,
            entries_after: 0,
            bytes_before,
            bytes_after: 0,
            duplicates_removed: 0,
            entries_dropped: 0,
            entries_summarized: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierCompactionSummary {
    pub results: Vec<TierCompactionResult>,
    pub auto_run: bool,
}

impl TierCompactionSummary {
    pub fn total_entries_before(&self) -> usize {
        self.results.iter().map(|r| r.entries_before).sum()
    }

    pub fn total_entries_after(&self) -> usize {
        self.results.iter().map(|r| r.entries_after).sum()
    }

    pub fn total_bytes_before(&self) -> usize {
        self.results.iter().map(|r| r.bytes_before).sum()
    }

    pub fn total_bytes_after(&self) -> usize {
        self.results.iter().map(|r| r.bytes_after).sum()
    }

    pub fn total_duplicates_removed(&self) -> usize {
        self.results.iter().map(|r| r.duplicates_removed).sum()
    }

    pub fn total_entries_summarized(&self) -> usize {
        self.results.iter().map(|r| r.entries_summarized).sum()
    }
}

impl fmt::Display for TierCompactionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(40);
        writeln!(f, "Tier Compaction Summary")?;
        writeln!(f, "{rule}")?;
        for r in &self.results {
            writeln!(f, "\n{}:", r.tier)?;
            writeln!(f, "  Entries: {} -> {}", r.entries_before, r.entries_after)?;
            writeln!(f, "  Size: {} -> {} bytes", r.bytes_before, r.bytes_after)?;
            if r.duplicates_removed > 0 {
                writeln!(f, "  Duplicates removed: {}", r.duplicates_removed)?;
            }
            if r.entries_summarized > 0 {
                writeln!(f, "  Entries summarized: {}", r.entries_summarized)?;
            }
        }
        writeln!(f, "\n{rule}")?;
        writeln!(
            f,
            "Total entries: {} -> {}",
            self.total_entries_before(),
            self.total_entries_after()
        )?;
        write!(
            f,
            "Total size: {} -> {} bytes",
            self.total_bytes_before(),
            self.total_bytes_after()
        )
    }
}

/// Ralph block with its body split from the header.
#[derive(Debug, Clone)]
struct Block {
    timestamp: String,
    iteration: u32,
    item_id: String,
    header: String,
    body: String,
}

impl Block {
    fn from_entry(entry: &ParsedEntry) -> Option<Self> {
        let (header, body) = match entry.raw_content.split_once('\n') {
            Some((header, body)) => (header.to_string(), body.to_string()),
            None => (entry.raw_content.clone(), String::new()),
        };
        Some(Self {
            timestamp: entry.timestamp.clone()?,
            iteration: entry.iteration?,
            item_id: entry.item_id.clone()?,
            header,
            body,
        })
    }

    fn render(&self) -> ParsedEntry {
        let raw = if self.body.is_empty() {
            self.header.clone()
        } else {
            format!("{}\n{}", self.header, self.body)
        };
        ParsedEntry::ralph(&self.timestamp, self.iteration, &self.item_id, raw)
    }
}

/// Compacts tier files in place.
pub struct TierCompactionHook {
    files: TierFiles,
    config: TierCompactionConfig,
}

impl TierCompactionHook {
    pub fn new(files: TierFiles, config: TierCompactionConfig) -> Self {
        Self { files, config }
    }

    pub fn compact_all(&self) -> Result<TierCompactionSummary> {
        let results = KnowledgeTier::ALL
            .into_iter()
            .map(|tier| self.compact_tier(tier))
            .collect::<Result<Vec<_>>>()?;
        let summary = TierCompactionSummary {
            results,
            auto_run: self.config.auto_run,
        };
        info!(
            entries_before = summary.total_entries_before(),
            entries_after = summary.total_entries_after(),
            duplicates_removed = summary.total_duplicates_removed(),
            "Tier compaction complete"
        );
        Ok(summary)
    }

    pub fn compact_tier(&self, tier: KnowledgeTier) -> Result<TierCompactionResult> {
        let content = self.files.read_tier(tier)?;
        let bytes_before = content.len();
        if content.trim().is_empty() {
            return Ok(TierCompactionResult::empty(tier, bytes_before));
        }

        let parsed = parse_tier_content(&content);
        let blocks: Vec<Block> = parsed.ralph_entries.iter().filter_map(Block::from_entry).collect();
        let entries_before = parsed.bullet_entries.len() + blocks.len();

        // Custom preambles survive; headerless tiers get the canonical one.
        let preamble = if parsed.preamble.iter().any(|line| !line.trim().is_empty()) {
            parsed.preamble
        } else {
            tier.default_header().lines().map(str::to_string).collect()
        };
        let (bullets, bullet_dupes) = dedupe_bullets(parsed.bullet_entries);
        let (blocks, block_dupes) = self.dedupe_blocks(blocks);
        let (blocks, entries_dropped) = self.apply_size_budget(blocks);
        let (blocks, entries_summarized) = self.maybe_summarize(blocks);

        let rebuilt = TierContent {
            preamble,
            bullet_entries: bullets,
            ralph_entries: blocks.iter().map(Block::render).collect(),
            unknown_lines: Vec::new(),
        };
        let new_content = merge_tier_content(&rebuilt);

        if new_content != content {
            self.files.write_tier(tier, &new_content)?;
        }

        let result = TierCompactionResult {
            tier,
            entries_before,
            entries_after: rebuilt.bullet_entries.len() + rebuilt.ralph_entries.len(),
            bytes_before,
            bytes_after: new_content.len(),
            duplicates_removed: bullet_dupes + block_dupes,
            entries_dropped,
            entries_summarized,
        };
        debug!(?result, "Compacted tier");
        Ok(result)
    }

    fn dedupe_blocks(&self, blocks: Vec<Block>) -> (Vec<Block>, usize) {
        let mut seen = HashSet::new();
        let mut removed = 0;
        let kept = blocks
            .into_iter()
            .filter(|block| {
                let mut key = format!("{}:{}", block.iteration, block.item_id);
                if self.config.strict_deduplication {
                    key = format!("{key}:{}", content_hash(&block.body));
                }
                let fresh = seen.insert(key);
                if !fresh {
                    removed += 1;
                }
                fresh
            })
            .collect();
        (kept, removed)
    }

    /// Keep the newest `max_entries_per_tier` blocks, newest first.
    fn apply_size_budget(&self, mut blocks: Vec<Block>) -> (Vec<Block>, usize) {
        let max = self.config.max_entries_per_tier;
        if blocks.len() <= max {
            return (blocks, 0);
        }
        blocks.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let dropped = blocks.len() - max;
        blocks.truncate(max);
        (blocks, dropped)
    }

    /// Collapse items with several blocks into one summary block each.
    fn maybe_summarize(&self, blocks: Vec<Block>) -> (Vec<Block>, usize) {
        if blocks.len() <= self.config.summary_threshold_entries {
            return (blocks, 0);
        }

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Block>> = HashMap::new();
        for block in blocks {
            if !groups.contains_key(&block.item_id) {
                order.push(block.item_id.clone());
            }
            groups.entry(block.item_id.clone()).or_default().push(block);
        }

        let mut out: Vec<Block> = Vec::new();
        let mut summaries = 0;
        let mut summarized = 0;
        for item_id in order {
            let Some(group) = groups.remove(&item_id) else {
                continue;
            };
            if group.len() > 1 && summaries < self.config.summary_max_entries {
                let count = group.len();
                if let Some(latest) = group.into_iter().max_by(|a, b| a.timestamp.cmp(&b.timestamp)) {
                    out.push(Block {
                        body: format!("- (Summarized {count} entries for this item)"),
                        ..latest
                    });
                    summaries += 1;
                    summarized += count - 1;
                }
            } else {
                out.extend(group);
            }
        }

        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(self.config.max_entries_per_tier);
        (out, summarized)
    }
}

fn dedupe_bullets(entries: Vec<ParsedEntry>) -> (Vec<ParsedEntry>, usize) {
    let mut seen = HashSet::new();
    let before = entries.len();
    let kept: Vec<ParsedEntry> = entries
        .into_iter()
        .filter(|e| seen.insert(normalize_content(&e.raw_content).to_lowercase()))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_token_count(content: &str) -> usize {
    content.chars().count().div_ceil(4)
}

/// Compact `tier` when `content` is estimated above `max_tokens`.
///
/// Returns whether compaction ran. A zero budget disables the check.
pub fn compact_if_over_tokens(
    files: &TierFiles,
    tier: KnowledgeTier,
    content: &str,
    max_tokens: usize,
    config: &TierCompactionConfig,
) -> Result<bool> {
    if max_tokens == 0 || estimate_token_count(content) <= max_tokens {
        return Ok(false);
    }
    info!(%tier, tokens = estimate_token_count(content), max_tokens, "Tier over token budget, compacting");
    TierCompactionHook::new(files.clone(), config.clone()).compact_tier(tier)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn block(day: u32, iteration: u32, item: &str, body: &str) -> String {
        format!("## 2026-03-{day:02}T10:00:00Z Iteration {iteration} ({item})\n{body}")
    }

    fn hook(dir: &TempDir, config: TierCompactionConfig) -> TierCompactionHook {
        TierCompactionHook::new(TierFiles::new(dir.path()), config)
    }

    #[test]
    fn test_empty_tier_is_untouched() {
        let dir = TempDir::new().unwrap();
        let result = hook(&dir, TierCompactionConfig::default())
            .compact_tier(KnowledgeTier::Guardrails)
            .unwrap();
        assert_eq!(result.entries_before, 0);
        assert!(!dir.path().join("GUARDRAILS.md").exists());
    }

    #[test]
    fn test_removes_duplicates_and_keeps_preamble() {
        let dir = TempDir::new().unwrap();
        let files = TierFiles::new(dir.path());
        let text = format!(
            "# Old title\n\n- [GOTCHA] Redis pool\n- [GOTCHA]  Redis   pool\n{}\n{}\n{}\n",
            block(1, 1, "AR-1", "- first"),
            block(2, 1, "AR-1", "- repeated"),
            block(3, 2, "AR-2", "- second"),
        );
        files.write_tier(KnowledgeTier::Guardrails, &text).unwrap();

        let result = hook(&dir, TierCompactionConfig::default())
            .compact_tier(KnowledgeTier::Guardrails)
            .unwrap();
        assert_eq!(result.entries_before, 5);
        assert_eq!(result.entries_after, 3);
        assert_eq!(result.duplicates_removed, 2);

        let written = files.read_tier(KnowledgeTier::Guardrails).unwrap();
        assert!(written.starts_with("# Old title\n\n- [GOTCHA] Redis pool\n\n## "));
        assert!(written.contains("- first"));
        assert!(!written.contains("- repeated"));
        assert_eq!(result.bytes_after, written.len());
    }

    #[test]
    fn test_custom_preamble_survives_compaction() {
        let dir = TempDir::new().unwrap();
        let files = TierFiles::new(dir.path());
        let text = format!(
            "# Team Guardrails\nOwned by the platform group.\n\n- [GOTCHA] a\n- [GOTCHA] a\n{}\n",
            block(1, 1, "AR-1", "- body"),
        );
        files.write_tier(KnowledgeTier::Guardrails, &text).unwrap();

        hook(&dir, TierCompactionConfig::default())
            .compact_tier(KnowledgeTier::Guardrails)
            .unwrap();
        assert_eq!(
            files.read_tier(KnowledgeTier::Guardrails).unwrap(),
            "# Team Guardrails\nOwned by the platform group.\n\n- [GOTCHA] a\n\n\
             ## 2026-03-01T10:00:00Z Iteration 1 (AR-1)\n- body\n"
        );
    }

    #[test]
    fn test_headerless_tier_gets_canonical_header() {
        let dir = TempDir::new().unwrap();
        let files = TierFiles::new(dir.path());
        files.write_tier(KnowledgeTier::Style, "- [PATTERN] a\n- [PATTERN] a\n").unwrap();

        hook(&dir, TierCompactionConfig::default())
            .compact_tier(KnowledgeTier::Style)
            .unwrap();
        assert_eq!(
            files.read_tier(KnowledgeTier::Style).unwrap(),
            "# Style\n\nPatterns and preferences learned during development.\n\n- [PATTERN] a\n"
        );
    }

    #[test]
    fn test_strict_dedup_keeps_different_bodies() {
        let dir = TempDir::new().unwrap();
        let files = TierFiles::new(dir.path());
        let text = format!("{}\n{}\n", block(1, 1, "AR-1", "- a"), block(2, 1, "AR-1", "- b"));
        files.write_tier(KnowledgeTier::Style, &text).unwrap();

        let config = TierCompactionConfig {
            strict_deduplication: true,
            ..Default::default()
        };
        let result = hook(&dir, config).compact_tier(KnowledgeTier::Style).unwrap();
        assert_eq!(result.duplicates_removed, 0);
        assert_eq!(result.entries_after, 2);
    }

    #[test]
    fn test_size_budget_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let files = TierFiles::new(dir.path());
        let text: Vec<String> = (1..=5).map(|i| block(i, i, &format!("AR-{i}"), "- body")).collect();
        files.write_tier(KnowledgeTier::Recent, &text.join("\n")).unwrap();

        let config = TierCompactionConfig {
            max_entries_per_tier: 2,
            ..Default::default()
        };
        let result = hook(&dir, config).compact_tier(KnowledgeTier::Recent).unwrap();
        assert_eq!(result.entries_dropped, 3);
        assert_eq!(result.entries_after, 2);

        let written = files.read_tier(KnowledgeTier::Recent).unwrap();
        let newest = written.find("(AR-5)").unwrap();
        let next = written.find("(AR-4)").unwrap();
        assert!(newest < next);
        assert!(!written.contains("(AR-1)"));
    }

    #[test]
    fn test_summarizes_repeated_items() {
        let dir = TempDir::new().unwrap();
        let files = TierFiles::new(dir.path());
        let text = [
            block(1, 1, "AR-1", "- one"),
            block(2, 2, "AR-1", "- two"),
            block(3, 3, "AR-1", "- three"),
            block(4, 4, "AR-2", "- solo"),
        ]
        .join("\n");
        files.write_tier(KnowledgeTier::Guardrails, &text).unwrap();

        let config = TierCompactionConfig {
            summary_threshold_entries: 2,
            ..Default::default()
        };
        let result = hook(&dir, config).compact_tier(KnowledgeTier::Guardrails).unwrap();
        assert_eq!(result.entries_summarized, 2);
        assert_eq!(result.entries_after, 2);

        let written = files.read_tier(KnowledgeTier::Guardrails).unwrap();
        assert!(written.contains(
            "## 2026-03-03T10:00:00Z Iteration 3 (AR-1)\n- (Summarized 3 entries for this item)"
        ));
        assert!(written.contains("- solo"));
    }

    #[test]
    fn test_compact_all_summary() {
        let dir = TempDir::new().unwrap();
        let files = TierFiles::new(dir.path());
        files
            .write_tier(KnowledgeTier::Style, "- [PATTERN] a\n- [PATTERN] a\n")
            .unwrap();

        let summary = hook(&dir, TierCompactionConfig::default()).compact_all().unwrap();
        assert_eq!(summary.results.len(), 3);
        assert_eq!(summary.total_duplicates_removed(), 1);
        assert!(summary.auto_run);
        assert!(summary.to_string().contains("STYLE:\n  Entries: 2 -> 1"));
    }

    #[test]
    fn test_token_estimate_and_threshold() {
        assert_eq!(estimate_token_count(""), 0);
        assert_eq!(estimate_token_count("abcd"), 1);
        assert_eq!(estimate_token_count("abcde"), 2);

        let dir = TempDir::new().unwrap();
        let files = TierFiles::new(dir.path());
        let content = "- [GOTCHA] x\n- [GOTCHA] x\n";
        files.write_tier(KnowledgeTier::Guardrails, content).unwrap();
        let config = TierCompactionConfig::default();

        assert!(!compact_if_over_tokens(&files, KnowledgeTier::Guardrails, content, 100, &config).unwrap());
        assert!(!compact_if_over_tokens(&files, KnowledgeTier::Guardrails, content, 0, &config).unwrap());
        assert!(compact_if_over_tokens(&files, KnowledgeTier::Guardrails, content, 1, &config).unwrap());
        let written = files.read_tier(KnowledgeTier::Guardrails).unwrap();
        assert_eq!(written.matches("- [GOTCHA] x").count(), 1);
    }
}
