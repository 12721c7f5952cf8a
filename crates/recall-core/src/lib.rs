//! recall-core - Persistent memory for AI coding-assistant sessions
//!
//! Observations are captured as an append-only log, distilled into three
//! knowledge tiers (GUARDRAILS.md, STYLE.md, RECENT.md) and served back through
//! full-text and hybrid retrieval.
//!
//! - **storage**: storage facade, SQLite store, resilient shared store
//! - **retrieval**: FTS and reciprocal-rank-fused hybrid search, reranking
//! - **session**: session lifecycle and explicit logging
//! - **sync**: transcript ingestion and the single-runner background sync
//! - **tiers**: tier file format, policy-driven writer, compaction and the LLM
//!   compaction engine
//! - **synthesis**: guardrail/style synthesis from loop iteration reports
//! - **context**: prompt context assembly

pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod retrieval;
pub mod session;
pub mod storage;
pub mod sync;
pub mod synthesis;
pub mod telemetry;
pub mod tiers;

// Re-export commonly used types
pub use config::AgentRecallConfig;
pub use context::ContextAssembler;
pub use error::{Error, Result};
pub use models::{Chunk, LogEntry, Scope, SemanticLabel, Session};
pub use retrieval::{RetrievalBackend, Retriever, SearchOptions};
pub use session::{LogWriter, SessionManager};
pub use storage::{LocalStore, RemoteStore, Storage, create_storage_backend};
pub use sync::{AutoSync, BackgroundSyncManager};
pub use synthesis::ClimateSynthesizer;
pub use tiers::{CompactionEngine, KnowledgeTier, TierFiles, TierWriter};
