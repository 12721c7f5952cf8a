//! Configuration for an agent memory directory.
//!
//! Configuration is loaded from `<agent_dir>/config.yaml`. The file may name
//! other files under `extends`; those are merged first (in order) and the main
//! file is merged last, so later values win. Merging happens over typed
//! partial structs and resolves once into an immutable [`AgentRecallConfig`].

use crate::embedding::DEFAULT_DIMENSIONS;
use crate::error::{Error, Result};
use crate::models::Scope;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILENAME: &str = "config.yaml";

/// Root configuration for `.agent/config.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRecallConfig {
    /// Files merged underneath this one, as written in the main file
    #[serde(default)]
    pub extends: Vec<String>,
    pub llm: LlmConfig,
    pub compaction: CompactionConfig,
    pub retrieval: RetrievalConfig,
    pub storage: StorageConfig,
    pub tier_compaction: TierCompactionConfig,
    pub synthesis: SynthesisConfig,
}

/// LLM provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-call timeout for text generation
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: None,
            api_key_env: None,
            temperature: 0.3,
            max_tokens: 4096,
            timeout_seconds: 120,
        }
    }
}

/// Compaction trigger thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub max_recent_tokens: usize,
    pub max_sessions_before_compact: usize,
    pub promote_pattern_after_occurrences: usize,
    pub archive_sessions_older_than_days: u32,
    pub max_tier_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_recent_tokens: 1500,
            max_sessions_before_compact: 5,
            promote_pattern_after_occurrences: 3,
            archive_sessions_older_than_days: 30,
            max_tier_tokens: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// "fts5" or "hybrid"
    pub backend: String,
    pub top_k: usize,
    pub fusion_k: usize,
    pub rerank_enabled: bool,
    pub rerank_candidate_k: usize,
    pub embedding_dimensions: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: "fts5".to_string(),
            top_k: 5,
            fusion_k: 60,
            rerank_enabled: false,
            rerank_candidate_k: 20,
            embedding_dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Local,
    Shared,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub shared: SharedStorageConfig,
    /// Reject writes under the implicit "default" namespace
    pub strict_namespace_validation: bool,
}

/// Shared backend settings (HTTP service or shared filesystem path)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedStorageConfig {
    /// `http(s)://...`, `file:///path` or `sqlite:///path`
    pub base_url: Option<String>,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_seconds: u64,
    pub tenant_id: String,
    pub project_id: String,
    /// Name of the env var holding the bearer token
    pub api_key_env: Option<String>,
    /// Fall back to the local store when the shared backend is unreachable
    pub local_fallback: bool,
    /// Directory mirroring tier files for the team
    pub tiers_dir: Option<PathBuf>,
}

impl Default for SharedStorageConfig {
    fn default() -> Self {
        let scope = Scope::default();
        Self {
            base_url: None,
            retry_attempts: 3,
            retry_backoff_ms: 200,
            max_backoff_ms: 5_000,
            timeout_seconds: 10,
            tenant_id: scope.tenant_id,
            project_id: scope.project_id,
            api_key_env: None,
            local_fallback: true,
            tiers_dir: None,
        }
    }
}

impl SharedStorageConfig {
    pub fn scope(&self) -> Scope {
        Scope::new(self.tenant_id.clone(), self.project_id.clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCompactionConfig {
    pub auto_run: bool,
    pub max_entries_per_tier: usize,
    pub strict_deduplication: bool,
    pub summary_threshold_entries: usize,
    pub summary_max_entries: usize,
}

impl Default for TierCompactionConfig {
    fn default() -> Self {
        Self {
            auto_run: true,
            max_entries_per_tier: 50,
            strict_deduplication: false,
            summary_threshold_entries: 40,
            summary_max_entries: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub max_guardrails: usize,
    pub max_style: usize,
    pub auto_after_loop: bool,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_guardrails: 30,
            max_style: 30,
            auto_after_loop: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl AgentRecallConfig {
    /// Load and resolve `<agent_dir>/config.yaml`, following `extends`.
    pub fn load(agent_dir: &Path) -> Result<Self> {
        let main = PartialConfig::read(&agent_dir.join(CONFIG_FILENAME))?;

        let mut merged = PartialConfig::default();
        for extend in main.extends.clone().unwrap_or_default() {
            let path = resolve_extend_path(agent_dir, &extend);
            debug!(path = %path.display(), "Merging extended config");
            merged = merged.merge(PartialConfig::read(&path)?);
        }

        let config = merged.merge(main).resolve();
        config.validate()?;
        Ok(config)
    }

    /// Parse a single YAML document without following `extends`.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let partial: PartialConfig = parse_yaml(yaml)?;
        let config = partial.resolve();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(invalid("retrieval.top_k", "must be greater than 0"));
        }
        if self.retrieval.embedding_dimensions == 0 {
            return Err(invalid("retrieval.embedding_dimensions", "must be greater than 0"));
        }
        if !matches!(self.retrieval.backend.as_str(), "fts5" | "fts" | "hybrid") {
            return Err(invalid("retrieval.backend", "must be one of fts5, hybrid"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(invalid("llm.temperature", "must be between 0 and 2"));
        }
        if self.storage.shared.retry_attempts == 0 {
            return Err(invalid("storage.shared.retry_attempts", "must be greater than 0"));
        }
        if self.storage.backend == StorageBackendKind::Shared
            && self.storage.shared.base_url.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(invalid("storage.shared.base_url", "is required for the shared backend"));
        }
        Ok(())
    }

    pub fn with_shared_backend(mut self, base_url: impl Into<String>) -> Self {
        self.storage.backend = StorageBackendKind::Shared;
        self.storage.shared.base_url = Some(base_url.into());
        self
    }

    pub fn with_scope(mut self, tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        self.storage.shared.tenant_id = tenant_id.into();
        self.storage.shared.project_id = project_id.into();
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.storage.shared.retry_attempts = attempts;
        self.storage.shared.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_rerank(mut self, enabled: bool) -> Self {
        self.retrieval.rerank_enabled = enabled;
        self
    }
}

fn invalid(field: &str, message: &str) -> Error {
    Error::validation(format!("invalid value for {field}: {message}"))
}

fn parse_yaml<T: serde::de::DeserializeOwned + Default>(yaml: &str) -> Result<T> {
    if yaml.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

fn resolve_extend_path(agent_dir: &Path, raw: &str) -> PathBuf {
    let expanded = match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        agent_dir.join(expanded)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Partial (mergeable) configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Overlay values replace base values field by field; nested sections merge
/// recursively.
trait Merge {
    fn merge(self, overlay: Self) -> Self;
}

impl<T: Merge> Merge for Option<T> {
    fn merge(self, overlay: Self) -> Self {
        match (self, overlay) {
            (Some(base), Some(over)) => Some(base.merge(over)),
            (base, None) => base,
            (None, over) => over,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialConfig {
    extends: Option<Vec<String>>,
    llm: Option<PartialLlm>,
    compaction: Option<PartialCompaction>,
    retrieval: Option<PartialRetrieval>,
    storage: Option<PartialStorage>,
    tier_compaction: Option<PartialTierCompaction>,
    synthesis: Option<PartialSynthesis>,
}

impl PartialConfig {
    fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        parse_yaml(&std::fs::read_to_string(path)?)
    }

    fn resolve(self) -> AgentRecallConfig {
        let mut config = AgentRecallConfig {
            extends: self.extends.unwrap_or_default(),
            ..Default::default()
        };
        if let Some(p) = self.llm {
            let c = &mut config.llm;
            set(&mut c.provider, p.provider);
            set(&mut c.model, p.model);
            c.base_url = p.base_url.or(c.base_url.take());
            c.api_key_env = p.api_key_env.or(c.api_key_env.take());
            set(&mut c.temperature, p.temperature);
            set(&mut c.max_tokens, p.max_tokens);
            set(&mut c.timeout_seconds, p.timeout_seconds);
        }
        if let Some(p) = self.compaction {
            let c = &mut config.compaction;
            set(&mut c.max_recent_tokens, p.max_recent_tokens);
            set(&mut c.max_sessions_before_compact, p.max_sessions_before_compact);
            set(&mut c.promote_pattern_after_occurrences, p.promote_pattern_after_occurrences);
            set(&mut c.archive_sessions_older_than_days, p.archive_sessions_older_than_days);
            set(&mut c.max_tier_tokens, p.max_tier_tokens);
        }
        if let Some(p) = self.retrieval {
            let c = &mut config.retrieval;
            set(&mut c.backend, p.backend);
            set(&mut c.top_k, p.top_k);
            set(&mut c.fusion_k, p.fusion_k);
            set(&mut c.rerank_enabled, p.rerank_enabled);
            set(&mut c.rerank_candidate_k, p.rerank_candidate_k);
            set(&mut c.embedding_dimensions, p.embedding_dimensions);
        }
        if let Some(p) = self.storage {
            let c = &mut config.storage;
            set(&mut c.backend, p.backend);
            set(&mut c.strict_namespace_validation, p.strict_namespace_validation);
            if let Some(s) = p.shared {
                let c = &mut c.shared;
                c.base_url = s.base_url.or(c.base_url.take());
                set(&mut c.retry_attempts, s.retry_attempts);
                set(&mut c.retry_backoff_ms, s.retry_backoff_ms);
                set(&mut c.max_backoff_ms, s.max_backoff_ms);
                set(&mut c.timeout_seconds, s.timeout_seconds);
                set(&mut c.tenant_id, s.tenant_id);
                set(&mut c.project_id, s.project_id);
                c.api_key_env = s.api_key_env.or(c.api_key_env.take());
                set(&mut c.local_fallback, s.local_fallback);
                c.tiers_dir = s.tiers_dir.or(c.tiers_dir.take());
            }
        }
        if let Some(p) = self.tier_compaction {
            let c = &mut config.tier_compaction;
            set(&mut c.auto_run, p.auto_run);
            set(&mut c.max_entries_per_tier, p.max_entries_per_tier);
            set(&mut c.strict_deduplication, p.strict_deduplication);
            set(&mut c.summary_threshold_entries, p.summary_threshold_entries);
            set(&mut c.summary_max_entries, p.summary_max_entries);
        }
        if let Some(p) = self.synthesis {
            let c = &mut config.synthesis;
            set(&mut c.max_guardrails, p.max_guardrails);
            set(&mut c.max_style, p.max_style);
            set(&mut c.auto_after_loop, p.auto_after_loop);
        }
        config
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl Merge for PartialConfig {
    fn merge(self, o: Self) -> Self {
        Self {
            extends: o.extends.or(self.extends),
            llm: self.llm.merge(o.llm),
            compaction: self.compaction.merge(o.compaction),
            retrieval: self.retrieval.merge(o.retrieval),
            storage: self.storage.merge(o.storage),
            tier_compaction: self.tier_compaction.merge(o.tier_compaction),
            synthesis: self.synthesis.merge(o.synthesis),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialLlm {
    provider: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    api_key_env: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_seconds: Option<u64>,
}

impl Merge for PartialLlm {
    fn merge(self, o: Self) -> Self {
        Self {
            provider: o.provider.or(self.provider),
            model: o.model.or(self.model),
            base_url: o.base_url.or(self.base_url),
            api_key_env: o.api_key_env.or(self.api_key_env),
            temperature: o.temperature.or(self.temperature),
            max_tokens: o.max_tokens.or(self.max_tokens),
            timeout_seconds: o.timeout_seconds.or(self.timeout_seconds),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialCompaction {
    max_recent_tokens: Option<usize>,
    max_sessions_before_compact: Option<usize>,
    promote_pattern_after_occurrences: Option<usize>,
    archive_sessions_older_than_days: Option<u32>,
    max_tier_tokens: Option<usize>,
}

impl Merge for PartialCompaction {
    fn merge(self, o: Self) -> Self {
        Self {
            max_recent_tokens: o.max_recent_tokens.or(self.max_recent_tokens),
            max_sessions_before_compact: o
                .max_sessions_before_compact
                .or(self.max_sessions_before_compact),
            promote_pattern_after_occurrences: o
                .promote_pattern_after_occurrences
                .or(self.promote_pattern_after_occurrences),
            archive_sessions_older_than_days: o
                .archive_sessions_older_than_days
                .or(self.archive_sessions_older_than_days),
            max_tier_tokens: o.max_tier_tokens.or(self.max_tier_tokens),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialRetrieval {
    backend: Option<String>,
    top_k: Option<usize>,
    fusion_k: Option<usize>,
    rerank_enabled: Option<bool>,
    rerank_candidate_k: Option<usize>,
    embedding_dimensions: Option<usize>,
}

impl Merge for PartialRetrieval {
    fn merge(self, o: Self) -> Self {
        Self {
            backend: o.backend.or(self.backend),
            top_k: o.top_k.or(self.top_k),
            fusion_k: o.fusion_k.or(self.fusion_k),
            rerank_enabled: o.rerank_enabled.or(self.rerank_enabled),
            rerank_candidate_k: o.rerank_candidate_k.or(self.rerank_candidate_k),
            embedding_dimensions: o.embedding_dimensions.or(self.embedding_dimensions),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialStorage {
    backend: Option<StorageBackendKind>,
    shared: Option<PartialShared>,
    strict_namespace_validation: Option<bool>,
}

impl Merge for PartialStorage {
    fn merge(self, o: Self) -> Self {
        Self {
            backend: o.backend.or(self.backend),
            shared: self.shared.merge(o.shared),
            strict_namespace_validation: o
                .strict_namespace_validation
                .or(self.strict_namespace_validation),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialShared {
    base_url: Option<String>,
    retry_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    timeout_seconds: Option<u64>,
    tenant_id: Option<String>,
    project_id: Option<String>,
    api_key_env: Option<String>,
    local_fallback: Option<bool>,
    tiers_dir: Option<PathBuf>,
}

impl Merge for PartialShared {
    fn merge(self, o: Self) -> Self {
        Self {
            base_url: o.base_url.or(self.base_url),
            retry_attempts: o.retry_attempts.or(self.retry_attempts),
            retry_backoff_ms: o.retry_backoff_ms.or(self.retry_backoff_ms),
            max_backoff_ms: o.max_backoff_ms.or(self.max_backoff_ms),
            timeout_seconds: o.timeout_seconds.or(self.timeout_seconds),
            tenant_id: o.tenant_id.or(self.tenant_id),
            project_id: o.project_id.or(self.project_id),
            api_key_env: o.api_key_env.or(self.api_key_env),
            local_fallback: o.local_fallback.or(self.local_fallback),
            tiers_dir: o.tiers_dir.or(self.tiers_dir),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialTierCompaction {
    auto_run: Option<bool>,
    max_entries_per_tier: Option<usize>,
    strict_deduplication: Option<bool>,
    summary_threshold_entries: Option<usize>,
    summary_max_entries: Option<usize>,
}

impl Merge for PartialTierCompaction {
    fn merge(self, o: Self) -> Self {
        Self {
            auto_run: o.auto_run.or(self.auto_run),
            max_entries_per_tier: o.max_entries_per_tier.or(self.max_entries_per_tier),
            strict_deduplication: o.strict_deduplication.or(self.strict_deduplication),
            summary_threshold_entries: o
                .summary_threshold_entries
                .or(self.summary_threshold_entries),
            summary_max_entries: o.summary_max_entries.or(self.summary_max_entries),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialSynthesis {
    max_guardrails: Option<usize>,
    max_style: Option<usize>,
    auto_after_loop: Option<bool>,
}

impl Merge for PartialSynthesis {
    fn merge(self, o: Self) -> Self {
        Self {
            max_guardrails: o.max_guardrails.or(self.max_guardrails),
            max_style: o.max_style.or(self.max_style),
            auto_after_loop: o.auto_after_loop.or(self.auto_after_loop),
        }
    }
}
