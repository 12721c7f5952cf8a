//! Tier file grammar.
//!
//! A tier file holds three kinds of content:
//!
//! - preamble lines before the first entry (title, description)
//! - bullet entries, `- [KIND] text`, and recent bullets, `**YYYY-MM-DD**: summary`
//! - Ralph blocks, a `## <timestamp> Iteration <n> (<item>)` header plus body lines
//!
//! [`merge_tier_content`] always emits preamble, then bullets, then Ralph
//! blocks. Source interleaving is not preserved, so `merge(parse(x))` is a
//! fixed point after one pass.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static BULLET_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*-\s*\[(?P<kind>[A-Z_]+)\]\s*(?P<text>.+?)\s*$").ok());

static RALPH_HEADER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^##\s+(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z)\s+(?:HARD FAILURE\s+)?Iteration\s+(?P<iter>\d+)\s+\((?P<item>[^)]+)\)",
    )
    .ok()
});

static RECENT_BULLET_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*\*\*(?P<date>\d{4}-\d{2}-\d{2})\*\*:\s*(?P<summary>.+?)\s*$").ok()
});

fn captures<'a>(re: &LazyLock<Option<Regex>>, line: &'a str) -> Option<Captures<'a>> {
    re.as_ref()?.captures(line.trim_end())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryFormat {
    Bullet,
    Ralph,
    RecentBullet,
    Preamble,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedEntry {
    pub format: EntryFormat,
    pub raw_content: String,
    pub timestamp: Option<String>,
    pub iteration: Option<u32>,
    pub item_id: Option<String>,
    pub kind: Option<String>,
    pub text: Option<String>,
}

impl ParsedEntry {
    fn new(format: EntryFormat, raw_content: impl Into<String>) -> Self {
        Self {
            format,
            raw_content: raw_content.into(),
            timestamp: None,
            iteration: None,
            item_id: None,
            kind: None,
            text: None,
        }
    }

    /// Bullet entry for `- [KIND] text`.
    pub fn bullet(kind: &str, text: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            text: Some(text.to_string()),
            ..Self::new(EntryFormat::Bullet, format!("- [{kind}] {text}"))
        }
    }

    /// Ralph block whose first line of `raw_content` is the header.
    pub fn ralph(timestamp: &str, iteration: u32, item_id: &str, raw_content: impl Into<String>) -> Self {
        Self {
            timestamp: Some(timestamp.to_string()),
            iteration: Some(iteration),
            item_id: Some(item_id.to_string()),
            ..Self::new(EntryFormat::Ralph, raw_content)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierContent {
    pub preamble: Vec<String>,
    /// Bullets and recent bullets, in source order
    pub bullet_entries: Vec<ParsedEntry>,
    pub ralph_entries: Vec<ParsedEntry>,
    /// Kept for inspection; dropped by [`merge_tier_content`]
    pub unknown_lines: Vec<String>,
}

pub fn detect_line_format(line: &str) -> EntryFormat {
    if is_ralph_header(line) {
        EntryFormat::Ralph
    } else if parse_bullet_entry(line).is_some() {
        EntryFormat::Bullet
    } else if captures(&RECENT_BULLET_RE, line).is_some() {
        EntryFormat::RecentBullet
    } else {
        EntryFormat::Unknown
    }
}

pub fn is_ralph_header(line: &str) -> bool {
    captures(&RALPH_HEADER_RE, line).is_some()
}

/// `(timestamp, iteration, item_id)` from a Ralph header line.
pub fn parse_ralph_header(line: &str) -> Option<(String, u32, String)> {
    let caps = captures(&RALPH_HEADER_RE, line)?;
    let iteration = caps["iter"].parse().ok()?;
    Some((caps["ts"].to_string(), iteration, caps["item"].to_string()))
}

/// `(kind, text)` from a `- [KIND] text` line.
pub fn parse_bullet_entry(line: &str) -> Option<(String, String)> {
    let caps = captures(&BULLET_RE, line)?;
    Some((caps["kind"].to_string(), caps["text"].to_string()))
}

fn parse_recent_bullet(line: &str) -> Option<ParsedEntry> {
    let caps = captures(&RECENT_BULLET_RE, line)?;
    Some(ParsedEntry {
        timestamp: Some(caps["date"].to_string()),
        text: Some(caps["summary"].to_string()),
        ..ParsedEntry::new(EntryFormat::RecentBullet, line)
    })
}

fn parse_bullet_line(line: &str) -> Option<ParsedEntry> {
    if let Some((kind, text)) = parse_bullet_entry(line) {
        return Some(ParsedEntry {
            kind: Some(kind),
            text: Some(text),
            ..ParsedEntry::new(EntryFormat::Bullet, line)
        });
    }
    parse_recent_bullet(line)
}

/// Ralph block being accumulated.
struct OpenBlock {
    timestamp: String,
    iteration: u32,
    item_id: String,
    lines: Vec<String>,
    blank_run: usize,
}

impl OpenBlock {
    fn start(line: &str) -> Option<Self> {
        let (timestamp, iteration, item_id) = parse_ralph_header(line)?;
        Some(Self {
            timestamp,
            iteration,
            item_id,
            lines: vec![line.to_string()],
            blank_run: 0,
        })
    }

    fn finish(mut self) -> ParsedEntry {
        while self.lines.last().is_some_and(|l| l.trim().is_empty()) {
            self.lines.pop();
        }
        ParsedEntry::ralph(&self.timestamp, self.iteration, &self.item_id, self.lines.join("\n"))
    }
}

/// Split tier text into preamble, bullet entries and Ralph blocks.
///
/// A Ralph block ends at the next Ralph header, at a `## ` heading, at a
/// second consecutive blank line, or at a bullet line. A terminating heading
/// is itself preamble when no entry has been seen yet and unknown otherwise.
pub fn parse_tier_content(content: &str) -> TierContent {
    let mut parsed = TierContent::default();
    let mut block: Option<OpenBlock> = None;
    let mut found_first_entry = false;

    for line in content.split('\n') {
        let mut heading_terminated = false;

        if let Some(open) = block.as_mut() {
            if is_ralph_header(line) {
                if let Some(done) = block.take() {
                    parsed.ralph_entries.push(done.finish());
                }
                block = OpenBlock::start(line);
                continue;
            }
            if line.starts_with("## ") {
                heading_terminated = true;
            } else if line.trim().is_empty() {
                open.blank_run += 1;
                if open.blank_run < 2 {
                    open.lines.push(line.to_string());
                    continue;
                }
            } else if parse_bullet_line(line).is_none() {
                open.blank_run = 0;
                open.lines.push(line.to_string());
                continue;
            }
            if let Some(done) = block.take() {
                parsed.ralph_entries.push(done.finish());
            }
        }

        if heading_terminated {
            if !line.trim().is_empty() {
                if found_first_entry {
                    parsed.unknown_lines.push(line.to_string());
                } else {
                    parsed.preamble.push(line.to_string());
                }
            }
            continue;
        }

        if let Some(open) = OpenBlock::start(line) {
            block = Some(open);
            found_first_entry = true;
            continue;
        }

        if let Some(entry) = parse_bullet_line(line) {
            parsed.bullet_entries.push(entry);
            found_first_entry = true;
            continue;
        }

        if !found_first_entry {
            parsed.preamble.push(line.to_string());
        } else if !line.trim().is_empty() {
            parsed.unknown_lines.push(line.to_string());
        }
    }

    if let Some(done) = block.take() {
        parsed.ralph_entries.push(done.finish());
    }
    parsed
}

/// Reassemble tier text: preamble, bullets, Ralph blocks, separated by a
/// blank line and ending with a single newline.
pub fn merge_tier_content(content: &TierContent) -> String {
    let mut parts: Vec<String> = Vec::new();

    let preamble = content.preamble.join("\n");
    let preamble = preamble.trim();
    if !preamble.is_empty() {
        parts.push(preamble.to_string());
    }

    let bullets = join_raw(&content.bullet_entries);
    if !bullets.trim().is_empty() {
        parts.push(bullets);
    }

    let ralph = join_raw(&content.ralph_entries);
    if !ralph.trim().is_empty() {
        parts.push(ralph);
    }

    if parts.is_empty() {
        return "\n".to_string();
    }
    parts.join("\n\n") + "\n"
}

fn join_raw(entries: &[ParsedEntry]) -> String {
    entries
        .iter()
        .map(|e| e.raw_content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `(preamble lines, bullet lines, Ralph blocks)` as raw strings.
pub fn split_tier_by_format(content: &str) -> (Vec<String>, Vec<String>, Vec<String>) {
    let parsed = parse_tier_content(content);
    let bullets = parsed.bullet_entries.into_iter().map(|e| e.raw_content).collect();
    let ralph = parsed.ralph_entries.into_iter().map(|e| e.raw_content).collect();
    (parsed.preamble, bullets, ralph)
}
