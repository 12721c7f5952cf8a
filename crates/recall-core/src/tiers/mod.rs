//! Knowledge tier files: GUARDRAILS.md, STYLE.md and RECENT.md.
//!
//! Writes always replace the whole file (temp file + rename), so a failed
//! synthesis never leaves a half-written tier behind.

pub mod compaction;
pub mod engine;
pub mod format;
pub mod writer;

pub use compaction::{
    TierCompactionHook, TierCompactionResult, TierCompactionSummary, compact_if_over_tokens,
    estimate_token_count,
};
pub use engine::{CompactionEngine, CompactionResult};
pub use format::{
    EntryFormat, ParsedEntry, TierContent, detect_line_format, merge_tier_content,
    parse_tier_content, split_tier_by_format,
};
pub use writer::{
    IterationContext, IterationOutcome, LintReport, TierStatistics, TierWriter, WriteMode,
    WritePolicy, get_tier_statistics, lint_tier_file, validate_tier_content,
};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KnowledgeTier {
    Guardrails,
    Style,
    Recent,
}

impl KnowledgeTier {
    pub const ALL: [KnowledgeTier; 3] = [Self::Guardrails, Self::Style, Self::Recent];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Guardrails => "GUARDRAILS.md",
            Self::Style => "STYLE.md",
            Self::Recent => "RECENT.md",
        }
    }

    /// Canonical header written when a tier is rebuilt from scratch.
    pub fn default_header(&self) -> &'static str {
        match self {
            Self::Guardrails => "# Guardrails\n\nRules and warnings learned during development.\n",
            Self::Style => "# Style\n\nPatterns and preferences learned during development.\n",
            Self::Recent => "# Recent\n\nRecent development activity summaries.\n",
        }
    }
}

impl fmt::Display for KnowledgeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Guardrails => "GUARDRAILS",
            Self::Style => "STYLE",
            Self::Recent => "RECENT",
        })
    }
}

/// Reads and writes tier files under an agent directory, optionally mirrored
/// to a team-shared directory.
#[derive(Debug, Clone)]
pub struct TierFiles {
    dir: PathBuf,
    shared_dir: Option<PathBuf>,
}

impl TierFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            shared_dir: None,
        }
    }

    /// Prefer tiers from `shared_dir` when present and mirror writes there.
    pub fn with_shared_dir(mut self, shared_dir: impl Into<PathBuf>) -> Self {
        self.shared_dir = Some(shared_dir.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, tier: KnowledgeTier) -> PathBuf {
        self.dir.join(tier.file_name())
    }

    /// Tier text, or "" when no file exists yet.
    pub fn read_tier(&self, tier: KnowledgeTier) -> Result<String> {
        if let Some(shared) = &self.shared_dir {
            let path = shared.join(tier.file_name());
            if path.exists() {
                return Ok(std::fs::read_to_string(path)?);
            }
        }
        match std::fs::read_to_string(self.path(tier)) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn write_tier(&self, tier: KnowledgeTier, content: &str) -> Result<()> {
        write_atomic(&self.path(tier), content)?;
        if let Some(shared) = &self.shared_dir {
            write_atomic(&shared.join(tier.file_name()), content)?;
        }
        debug!(%tier, bytes = content.len(), "Wrote tier file");
        Ok(())
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
    std::fs::write(&tmp, content)?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
