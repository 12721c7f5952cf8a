//! Discover native agent sessions, extract learnings and persist them.

use super::background::SyncRunner;
use super::extract::TranscriptExtractor;
use crate::config::{AgentRecallConfig, TierCompactionConfig};
use crate::embedding::DEFAULT_DIMENSIONS;
use crate::error::{Error, Result};
use crate::ingest::{LearningExtractor, RawSession, SessionIngester, normalize_source};
use crate::llm::{GenerationOptions, TextGenerator};
use crate::models::LogEntry;
use crate::storage::Storage;
use crate::tiers::{CompactionEngine, CompactionResult, TierFiles};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(45);
const EXTRACT_ATTEMPTS: u32 = 3;
const EXTRACT_BACKOFF: Duration = Duration::from_secs(2);
const ZERO_LEARNING_WARNING_MIN_MESSAGES: usize = 50;

/// Which sessions a sync pass should look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    pub since: Option<DateTime<Utc>>,
    /// Source names; matched after normalization (`Claude_Code` == `claude-code`).
    pub sources: Option<Vec<String>>,
    pub session_ids: Option<Vec<String>>,
    pub max_sessions: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub discovered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub already_processed: usize,
    pub extraction_failed: usize,
    pub empty: usize,
    pub learnings: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Processed,
    SkippedAlreadyProcessed,
    SkippedEmpty,
    FailedExtraction,
    FailedParse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDiagnostic {
    pub source: String,
    pub session_id: String,
    pub outcome: SessionOutcome,
    pub message_count: Option<usize>,
    pub learnings_extracted: usize,
    pub error: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub sessions_discovered: usize,
    pub sessions_processed: usize,
    pub sessions_skipped: usize,
    pub sessions_already_processed: usize,
    pub empty_sessions: usize,
    pub learnings_extracted: usize,
    pub by_source: BTreeMap<String, SourceCounts>,
    pub diagnostics: Vec<SessionDiagnostic>,
    pub errors: Vec<String>,
    pub compaction: Option<CompactionResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRow {
    pub source: String,
    pub session_id: String,
    pub session_path: PathBuf,
    pub processed: bool,
    pub title: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: usize,
    pub project_path: Option<PathBuf>,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListCounts {
    pub discovered: usize,
    pub listed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionListing {
    pub sessions_discovered: usize,
    pub by_source: BTreeMap<String, ListCounts>,
    pub sessions: Vec<SessionRow>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub available: bool,
    pub sessions_found: usize,
    pub error: Option<String>,
}

struct Candidate {
    ingester: Arc<dyn SessionIngester>,
    source: String,
    path: PathBuf,
    session_id: String,
    sort_key: f64,
}

impl Candidate {
    fn label(&self) -> String {
        let file = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string());
        format!("{}:{file}", self.source)
    }
}

struct Discovery {
    active_sources: Vec<String>,
    candidates: Vec<Candidate>,
    errors: Vec<String>,
}

pub struct AutoSync {
    storage: Arc<dyn Storage>,
    files: TierFiles,
    ingesters: Vec<Arc<dyn SessionIngester>>,
    generator: Option<Arc<dyn TextGenerator>>,
    extractor: Option<Arc<dyn LearningExtractor>>,
    options: GenerationOptions,
    embedding_dimensions: usize,
    token_budget: Option<(usize, TierCompactionConfig)>,
    extract_timeout: Duration,
    extract_attempts: u32,
    extract_backoff: Duration,
}

impl AutoSync {
    pub fn new(
        storage: Arc<dyn Storage>,
        files: TierFiles,
        ingesters: Vec<Arc<dyn SessionIngester>>,
    ) -> Self {
        Self {
            storage,
            files,
            ingesters,
            generator: None,
            extractor: None,
            options: GenerationOptions::default(),
            embedding_dimensions: DEFAULT_DIMENSIONS,
            token_budget: None,
            extract_timeout: EXTRACT_TIMEOUT,
            extract_attempts: EXTRACT_ATTEMPTS,
            extract_backoff: EXTRACT_BACKOFF,
        }
    }

    /// Use `generator` for compaction and, unless an extractor was set,
    /// for transcript extraction.
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        if self.extractor.is_none() {
            self.extractor = Some(Arc::new(TranscriptExtractor::new(generator.clone())));
        }
        self.generator = Some(generator);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn LearningExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Apply LLM, embedding and tier budget settings.
    pub fn with_config(mut self, config: &AgentRecallConfig) -> Self {
        self.options = GenerationOptions::from_config(&config.llm);
        self.embedding_dimensions = config.retrieval.embedding_dimensions;
        self.token_budget = config
            .tier_compaction
            .auto_run
            .then(|| (config.compaction.max_tier_tokens, config.tier_compaction.clone()));
        self
    }

    pub fn with_extract_retry(mut self, timeout: Duration, attempts: u32, backoff: Duration) -> Self {
        self.extract_timeout = timeout;
        self.extract_attempts = attempts.max(1);
        self.extract_backoff = backoff;
        self
    }

    pub async fn run(&self, request: &SyncRequest) -> Result<SyncReport> {
        let Some(extractor) = self.extractor.clone() else {
            return Err(Error::collaborator("LLM provider is required for sync"));
        };

        let mut report = SyncReport::default();
        let discovery = self.discover(request);
        report.errors.extend(discovery.errors);
        for source in discovery.active_sources {
            report.by_source.insert(source, SourceCounts::default());
        }

        let (selected, missing) = select_candidates(discovery.candidates, request);
        if !missing.is_empty() {
            report
                .errors
                .push(format!("Requested session IDs not found: {}", missing.join(", ")));
        }
        report.sessions_discovered = selected.len();
        for candidate in &selected {
            report.by_source.entry(candidate.source.clone()).or_default().discovered += 1;
        }

        for candidate in &selected {
            self.process_candidate(extractor.as_ref(), candidate, &mut report).await?;
        }

        info!(
            discovered = report.sessions_discovered,
            processed = report.sessions_processed,
            skipped = report.sessions_skipped,
            learnings = report.learnings_extracted,
            errors = report.errors.len(),
            "Session sync complete"
        );
        Ok(report)
    }

    /// Sync, then compact when learnings were extracted or `force_compact`.
    pub async fn run_and_compact(&self, request: &SyncRequest, force_compact: bool) -> Result<SyncReport> {
        let mut report = self.run(request).await?;
        if report.learnings_extracted == 0 && !force_compact {
            return Ok(report);
        }

        let Some(generator) = self.generator.clone() else {
            return Err(Error::collaborator("LLM provider is required for compaction"));
        };
        let mut engine = CompactionEngine::new(self.storage.clone(), self.files.clone(), generator)
            .with_options(self.options)
            .with_embedding_dimensions(self.embedding_dimensions);
        if let Some((max_tokens, config)) = &self.token_budget {
            engine = engine.with_token_budget(*max_tokens, config.clone());
        }
        report.compaction = Some(engine.compact(force_compact).await?);
        Ok(report)
    }

    /// Discovered sessions with parse details, without extracting anything.
    pub async fn list_sessions(&self, request: &SyncRequest) -> Result<SessionListing> {
        let mut listing = SessionListing::default();
        let discovery = self.discover(request);
        listing.errors.extend(discovery.errors);
        for source in discovery.active_sources {
            listing.by_source.insert(source, ListCounts::default());
        }

        let (selected, missing) = select_candidates(discovery.candidates, request);
        if !missing.is_empty() {
            listing
                .errors
                .push(format!("Requested session IDs not found: {}", missing.join(", ")));
        }
        listing.sessions_discovered = selected.len();

        for candidate in selected {
            let counts = listing.by_source.entry(candidate.source.clone()).or_default();
            counts.discovered += 1;
            counts.listed += 1;

            let mut row = SessionRow {
                source: candidate.source.clone(),
                session_id: candidate.session_id.clone(),
                session_path: candidate.path.clone(),
                processed: self.storage.is_session_processed(&candidate.session_id).await?,
                title: None,
                started_at: None,
                ended_at: None,
                message_count: 0,
                project_path: None,
                parse_error: None,
            };
            match candidate.ingester.parse_session(&candidate.path) {
                Ok(session) => {
                    row.title = session.title;
                    row.started_at = Some(session.started_at);
                    row.ended_at = session.ended_at;
                    row.message_count = session.messages.len();
                    row.project_path = session.project_path;
                }
                Err(err) => {
                    listing.errors.push(format!("{}: {err:#}", candidate.label()));
                    row.parse_error = Some(format!("{err:#}"));
                }
            }
            listing.sessions.push(row);
        }
        Ok(listing)
    }

    /// Availability of every configured source.
    pub fn get_source_status(&self) -> BTreeMap<String, SourceStatus> {
        self.ingesters
            .iter()
            .map(|ingester| {
                let status = match ingester.discover_sessions(None) {
                    Ok(paths) => SourceStatus {
                        available: true,
                        sessions_found: paths.len(),
                        error: None,
                    },
                    Err(err) => SourceStatus {
                        available: false,
                        sessions_found: 0,
                        error: Some(format!("{err:#}")),
                    },
                };
                (ingester.source_name().to_string(), status)
            })
            .collect()
    }

    fn discover(&self, request: &SyncRequest) -> Discovery {
        let wanted: Option<BTreeSet<String>> = request
            .sources
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| s.iter().map(|name| normalize_source(name)).collect());

        let mut discovery = Discovery {
            active_sources: Vec::new(),
            candidates: Vec::new(),
            errors: Vec::new(),
        };

        for ingester in &self.ingesters {
            let source = ingester.source_name().to_string();
            if wanted
                .as_ref()
                .is_some_and(|w| !w.contains(&normalize_source(&source)))
            {
                continue;
            }
            discovery.active_sources.push(source.clone());

            let paths = match ingester.discover_sessions(request.since) {
                Ok(paths) => paths,
                Err(err) => {
                    warn!(%source, error = %err, "Session discovery failed");
                    discovery.errors.push(format!("{source}: {err:#}"));
                    continue;
                }
            };

            for path in paths {
                match ingester.get_session_id(&path) {
                    Ok(session_id) => discovery.candidates.push(Candidate {
                        ingester: ingester.clone(),
                        source: source.clone(),
                        sort_key: sort_key(&path, &session_id),
                        path,
                        session_id,
                    }),
                    Err(err) => {
                        let file = path.file_name().map(|n| n.to_string_lossy().into_owned());
                        discovery
                            .errors
                            .push(format!("{source}:{}: {err:#}", file.unwrap_or_default()));
                    }
                }
            }
        }
        discovery
    }

    async fn process_candidate(
        &self,
        extractor: &dyn LearningExtractor,
        candidate: &Candidate,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut diagnostic = SessionDiagnostic {
            source: candidate.source.clone(),
            session_id: candidate.session_id.clone(),
            outcome: SessionOutcome::Processed,
            message_count: None,
            learnings_extracted: 0,
            error: None,
            warning: None,
        };

        if self.storage.is_session_processed(&candidate.session_id).await? {
            let counts = report.by_source.entry(candidate.source.clone()).or_default();
            counts.skipped += 1;
            counts.already_processed += 1;
            report.sessions_skipped += 1;
            report.sessions_already_processed += 1;
            diagnostic.outcome = SessionOutcome::SkippedAlreadyProcessed;
            report.diagnostics.push(diagnostic);
            return Ok(());
        }

        let session = match candidate.ingester.parse_session(&candidate.path) {
            Ok(session) => session,
            Err(err) => {
                let message = format!("{err:#}");
                report.errors.push(format!("{}: {message}", candidate.label()));
                diagnostic.outcome = SessionOutcome::FailedParse;
                diagnostic.error = Some(message);
                report.diagnostics.push(diagnostic);
                return Ok(());
            }
        };

        let message_count = session.messages.len();
        diagnostic.message_count = Some(message_count);

        if message_count < 2 {
            self.storage.mark_session_processed(&candidate.session_id).await?;
            let counts = report.by_source.entry(candidate.source.clone()).or_default();
            counts.skipped += 1;
            counts.empty += 1;
            report.sessions_skipped += 1;
            report.empty_sessions += 1;
            diagnostic.outcome = SessionOutcome::SkippedEmpty;
            report.diagnostics.push(diagnostic);
            return Ok(());
        }

        let entries = match self.extract_with_retry(extractor, candidate, &session).await {
            Ok(entries) => entries,
            Err(message) => {
                report.errors.push(message.clone());
                let counts = report.by_source.entry(candidate.source.clone()).or_default();
                counts.skipped += 1;
                counts.extraction_failed += 1;
                report.sessions_skipped += 1;
                diagnostic.outcome = SessionOutcome::FailedExtraction;
                diagnostic.error = Some(message);
                report.diagnostics.push(diagnostic);
                return Ok(());
            }
        };

        for entry in &entries {
            self.storage.append_entry(entry).await?;
        }
        self.storage.mark_session_processed(&candidate.session_id).await?;

        let learnings = entries.len();
        let counts = report.by_source.entry(candidate.source.clone()).or_default();
        counts.processed += 1;
        counts.learnings += learnings;
        report.sessions_processed += 1;
        report.learnings_extracted += learnings;
        diagnostic.learnings_extracted = learnings;

        if learnings == 0 && message_count >= ZERO_LEARNING_WARNING_MIN_MESSAGES {
            let warning = format!(
                "{}:{} has {message_count} messages but yielded 0 learnings",
                candidate.source, candidate.session_id
            );
            report.errors.push(warning.clone());
            diagnostic.warning = Some(warning);
        }
        debug!(session_id = %candidate.session_id, learnings, "Session processed");
        report.diagnostics.push(diagnostic);
        Ok(())
    }

    /// Extract under a timeout, retrying timeouts and transient failures with
    /// linear backoff. The error is the report line for the last attempt.
    async fn extract_with_retry(
        &self,
        extractor: &dyn LearningExtractor,
        candidate: &Candidate,
        session: &RawSession,
    ) -> std::result::Result<Vec<LogEntry>, String> {
        let attempts = self.extract_attempts;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let outcome = tokio::time::timeout(self.extract_timeout, extractor.extract(session)).await;
            last_error = match outcome {
                Ok(Ok(entries)) => return Ok(entries),
                Err(_) => format!(
                    "{}: extraction timed out after {}s (attempt {attempt}/{attempts})",
                    candidate.label(),
                    self.extract_timeout.as_secs()
                ),
                Ok(Err(err)) if is_retryable(&err) => format!(
                    "{}: extraction rate-limited: {err:#} (attempt {attempt}/{attempts})",
                    candidate.label()
                ),
                Ok(Err(err)) => {
                    return Err(format!("{}: extraction failed: {err:#}", candidate.label()));
                }
            };

            if attempt < attempts {
                let delay = self.extract_backoff * attempt;
                warn!(
                    session_id = %candidate.session_id,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Extraction failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl SyncRunner for AutoSync {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncReport> {
        self.run(request).await
    }

    async fn sync_and_compact(&self, request: &SyncRequest, force_compact: bool) -> Result<SyncReport> {
        self.run_and_compact(request, force_compact).await
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<Error>().is_some_and(Error::is_transient) {
        return true;
    }
    let message = format!("{err:#}").to_lowercase();
    message.contains("rate limit") || message.contains("429")
}

/// Newest-first key: file mtime, else a numeric id suffix (ms are scaled to s).
fn sort_key(path: &Path, session_id: &str) -> f64 {
    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
        if let Ok(elapsed) = modified.duration_since(UNIX_EPOCH) {
            return elapsed.as_secs_f64();
        }
    }
    let token = session_id.rsplit('-').next().unwrap_or_default();
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return 0.0;
    }
    match token.parse::<f64>() {
        Ok(n) if n > 1e12 => n / 1000.0,
        Ok(n) => n,
        Err(_) => 0.0,
    }
}

/// Apply the session id filter, order newest first and cap.
fn select_candidates(
    mut candidates: Vec<Candidate>,
    request: &SyncRequest,
) -> (Vec<Candidate>, Vec<String>) {
    let mut missing = Vec::new();

    if let Some(ids) = request.session_ids.as_ref().filter(|ids| !ids.is_empty()) {
        let requested: BTreeSet<String> = ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        candidates.retain(|c| requested.contains(&c.session_id));
        let found: BTreeSet<&str> = candidates.iter().map(|c| c.session_id.as_str()).collect();
        missing = requested
            .iter()
            .filter(|id| !found.contains(id.as_str()))
            .cloned()
            .collect();
    }

    candidates.sort_by(|a, b| {
        b.sort_key
            .total_cmp(&a.sort_key)
            .then_with(|| b.session_id.cmp(&a.session_id))
    });
    if let Some(max) = request.max_sessions {
        candidates.truncate(max);
    }
    (candidates, missing)
}
