//! Embedded SQLite backend.

use super::{ClearFilter, Storage};
use crate::embedding::{content_hash, tokenize};
use crate::error::{Error, Result};
use crate::models::{
    BackgroundSyncStatus, Chunk, LogEntry, RecentSourceSession, Scope, SemanticLabel, Session,
    SessionCheckpoint, SessionHighlight, SessionStatus, StorageStats,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const SCHEMA: &str = include_str!("migrations/001_initial.sql");
const FTS_SCHEMA: &str = include_str!("migrations/002_chunks_fts.sql");

const DROP_FTS: &str = "
    DROP TRIGGER IF EXISTS chunks_ai;
    DROP TRIGGER IF EXISTS chunks_ad;
    DROP TRIGGER IF EXISTS chunks_au;
    DROP TABLE IF EXISTS chunks_fts;
";

const SESSION_COLUMNS: &str = "id, status, started_at, ended_at, task, summary, entry_count";
const ENTRY_COLUMNS: &str = "id, session_id, source, source_session_id, timestamp, content, \
                             label, tags, confidence, metadata";
const CHUNK_COLUMNS: &str = "c.id, c.source, c.source_ids, c.content, c.label, c.tags, \
                             c.created_at, c.token_count, c.embedding";
const CHECKPOINT_COLUMNS: &str = "id, source_session_id, last_message_timestamp, \
                                  last_message_index, content_hash, checkpoint_at, updated_at";
const SYNC_STATUS_COLUMNS: &str = "id, is_running, started_at, completed_at, sessions_processed, \
                                   learnings_extracted, error_message, pid, updated_at";

/// SQLite-backed store for one tenant/project scope.
///
/// Several stores may share a database file with different scopes.
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    scope: Scope,
    strict_namespace: bool,
}

impl LocalStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, scope: Scope) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn, Some(path.to_path_buf()), scope)
    }

    pub fn open_in_memory(scope: Scope) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None, scope)
    }

    fn init(conn: Connection, path: Option<PathBuf>, scope: Scope) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(FTS_SCHEMA)?;
        debug!(path = ?path, tenant = %scope.tenant_id, project = %scope.project_id, "Opened local store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            scope,
            strict_namespace: false,
        })
    }

    /// Reject writes while the scope is the implicit default namespace.
    pub fn with_strict_namespace(mut self, strict: bool) -> Self {
        self.strict_namespace = strict;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Drop and recreate the FTS table and triggers from canonical chunk rows.
    pub fn rebuild_chunks_fts(&self) -> Result<()> {
        self.with_conn(rebuild_fts)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        f(&conn)
    }

    fn check_write(&self) -> Result<()> {
        if self.strict_namespace {
            self.scope.validate_shared_namespace()?;
        }
        Ok(())
    }

    fn count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE tenant_id = ?1 AND project_id = ?2");
        self.with_conn(|conn| {
            Ok(conn.query_row(&sql, params![self.scope.tenant_id, self.scope.project_id], |row| {
                row.get(0)
            })?)
        })
    }

    fn clear_scoped(&self, table: &str, filter: &ClearFilter) -> Result<usize> {
        self.check_write()?;
        let base = format!("DELETE FROM {table} WHERE tenant_id = ?1 AND project_id = ?2");
        let (t, p) = (&self.scope.tenant_id, &self.scope.project_id);
        self.with_conn(|conn| {
            let removed = if let Some(id) = filter.source_session_id.as_deref() {
                conn.execute(&format!("{base} AND source_session_id = ?3"), params![t, p, id])?
            } else if let Some(pattern) = filter.source_pattern() {
                conn.execute(
                    &format!("{base} AND source_session_id LIKE ?3"),
                    params![t, p, pattern],
                )?
            } else {
                conn.execute(&base, params![t, p])?
            };
            Ok(removed)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Row mappers
    // ─────────────────────────────────────────────────────────────────────────

    fn map_session(row: &Row) -> rusqlite::Result<Session> {
        Ok(Session {
            id: parse_uuid(&row.get::<_, String>("id")?)?,
            status: parse_enum(&row.get::<_, String>("status")?)?,
            started_at: parse_ts(&row.get::<_, String>("started_at")?)?,
            ended_at: parse_opt_ts(row.get("ended_at")?)?,
            task: row.get("task")?,
            summary: row.get("summary")?,
            entry_count: row.get("entry_count")?,
        })
    }

    fn map_entry(row: &Row) -> rusqlite::Result<LogEntry> {
        let session_id: Option<String> = row.get("session_id")?;
        Ok(LogEntry {
            id: parse_uuid(&row.get::<_, String>("id")?)?,
            session_id: session_id.as_deref().map(parse_uuid).transpose()?,
            source: parse_enum(&row.get::<_, String>("source")?)?,
            source_session_id: row.get("source_session_id")?,
            timestamp: parse_ts(&row.get::<_, String>("timestamp")?)?,
            content: row.get("content")?,
            label: parse_enum(&row.get::<_, String>("label")?)?,
            tags: parse_json(&row.get::<_, String>("tags")?)?,
            confidence: row.get("confidence")?,
            metadata: parse_json(&row.get::<_, String>("metadata")?)?,
        })
    }

    fn map_chunk(row: &Row) -> rusqlite::Result<Chunk> {
        let source_ids: Vec<String> = parse_json(&row.get::<_, String>("source_ids")?)?;
        let embedding: Option<String> = row.get("embedding")?;
        Ok(Chunk {
            id: parse_uuid(&row.get::<_, String>("id")?)?,
            source: parse_enum(&row.get::<_, String>("source")?)?,
            source_ids: source_ids
                .iter()
                .map(|id| parse_uuid(id))
                .collect::<rusqlite::Result<_>>()?,
            content: row.get("content")?,
            label: parse_enum(&row.get::<_, String>("label")?)?,
            tags: parse_json(&row.get::<_, String>("tags")?)?,
            created_at: parse_ts(&row.get::<_, String>("created_at")?)?,
            token_count: row.get("token_count")?,
            // Unreadable vectors are treated as absent
            embedding: embedding.and_then(|raw| serde_json::from_str(&raw).ok()),
        })
    }

    fn map_checkpoint(row: &Row) -> rusqlite::Result<SessionCheckpoint> {
        Ok(SessionCheckpoint {
            id: parse_uuid(&row.get::<_, String>("id")?)?,
            source_session_id: row.get("source_session_id")?,
            last_message_timestamp: parse_opt_ts(row.get("last_message_timestamp")?)?,
            last_message_index: row.get("last_message_index")?,
            content_hash: row.get("content_hash")?,
            checkpoint_at: parse_ts(&row.get::<_, String>("checkpoint_at")?)?,
            updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
        })
    }

    fn map_sync_status(row: &Row) -> rusqlite::Result<BackgroundSyncStatus> {
        Ok(BackgroundSyncStatus {
            id: parse_uuid(&row.get::<_, String>("id")?)?,
            is_running: row.get("is_running")?,
            started_at: parse_opt_ts(row.get("started_at")?)?,
            completed_at: parse_opt_ts(row.get("completed_at")?)?,
            sessions_processed: row.get("sessions_processed")?,
            learnings_extracted: row.get("learnings_extracted")?,
            error_message: row.get("error_message")?,
            pid: row.get("pid")?,
            updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
        })
    }
}

#[async_trait]
impl Storage for LocalStore {
    fn scope(&self) -> &Scope {
        &self.scope
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.check_write()?;
        session.validate()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions
                    (id, tenant_id, project_id, status, started_at, ended_at, task, summary, entry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session.id.to_string(),
                    self.scope.tenant_id,
                    self.scope.project_id,
                    session.status.as_str(),
                    ts(&session.started_at),
                    session.ended_at.as_ref().map(ts),
                    session.task,
                    session.summary,
                    session.entry_count,
                ],
            )?;
            Ok(())
        })
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE id = ?1 AND tenant_id = ?2 AND project_id = ?3"
                    ),
                    params![id.to_string(), self.scope.tenant_id, self.scope.project_id],
                    Self::map_session,
                )
                .optional()?)
        })
    }

    async fn get_active_session(&self) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE status = ?1 AND tenant_id = ?2 AND project_id = ?3
                         ORDER BY started_at DESC LIMIT 1"
                    ),
                    params![
                        SessionStatus::Active.as_str(),
                        self.scope.tenant_id,
                        self.scope.project_id
                    ],
                    Self::map_session,
                )
                .optional()?)
        })
    }

    async fn list_sessions(
        &self,
        limit: usize,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE tenant_id = ?1 AND project_id = ?2 AND (?3 IS NULL OR status = ?3)
                 ORDER BY started_at DESC LIMIT ?4"
            ))?;
            let sessions = stmt
                .query_map(
                    params![
                        self.scope.tenant_id,
                        self.scope.project_id,
                        status.map(|s| s.as_str()),
                        limit as i64
                    ],
                    Self::map_session,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        self.check_write()?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = ?1, ended_at = ?2, summary = ?3, entry_count = ?4
                 WHERE id = ?5 AND tenant_id = ?6 AND project_id = ?7",
                params![
                    session.status.as_str(),
                    session.ended_at.as_ref().map(ts),
                    session.summary,
                    session.entry_count,
                    session.id.to_string(),
                    self.scope.tenant_id,
                    self.scope.project_id,
                ],
            )?;
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Log entries
    // ─────────────────────────────────────────────────────────────────────────

    async fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        self.check_write()?;
        entry.validate()?;
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO log_entries
                    (id, tenant_id, project_id, session_id, source, source_session_id,
                     timestamp, content, label, tags, confidence, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    entry.id.to_string(),
                    self.scope.tenant_id,
                    self.scope.project_id,
                    entry.session_id.map(|id| id.to_string()),
                    entry.source.as_str(),
                    entry.source_session_id,
                    ts(&entry.timestamp),
                    entry.content,
                    entry.label.as_str(),
                    serde_json::to_string(&entry.tags)?,
                    entry.confidence,
                    serde_json::to_string(&entry.metadata)?,
                ],
            )?;
            if let Some(session_id) = entry.session_id {
                tx.execute(
                    "UPDATE sessions SET entry_count = entry_count + 1
                     WHERE id = ?1 AND tenant_id = ?2 AND project_id = ?3",
                    params![session_id.to_string(), self.scope.tenant_id, self.scope.project_id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn get_entries(&self, session_id: Uuid) -> Result<Vec<LogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM log_entries
                 WHERE session_id = ?1 AND tenant_id = ?2 AND project_id = ?3
                 ORDER BY timestamp, id"
            ))?;
            let entries = stmt
                .query_map(
                    params![session_id.to_string(), self.scope.tenant_id, self.scope.project_id],
                    Self::map_entry,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    async fn get_entries_by_label(
        &self,
        labels: &[SemanticLabel],
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..labels.len()).map(|i| format!("?{}", i + 3)).collect::<Vec<_>>();
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM log_entries
             WHERE tenant_id = ?1 AND project_id = ?2 AND label IN ({})
             ORDER BY timestamp DESC, id ASC LIMIT ?{}",
            placeholders.join(", "),
            labels.len() + 3
        );

        let mut values = vec![
            Value::Text(self.scope.tenant_id.clone()),
            Value::Text(self.scope.project_id.clone()),
        ];
        values.extend(labels.iter().map(|l| Value::Text(l.as_str().to_string())));
        values.push(Value::Integer(limit as i64));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params_from_iter(values.iter()), Self::map_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    async fn count_log_entries(&self) -> Result<i64> {
        self.count("log_entries")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chunks
    // ─────────────────────────────────────────────────────────────────────────

    async fn store_chunk(&self, chunk: &Chunk) -> Result<bool> {
        self.check_write()?;
        let source_ids: Vec<String> = chunk.source_ids.iter().map(Uuid::to_string).collect();
        let source_ids = serde_json::to_string(&source_ids)?;
        let tags = serde_json::to_string(&chunk.tags)?;
        let embedding = chunk.embedding.as_ref().map(serde_json::to_string).transpose()?;
        let hash = content_hash(&chunk.content);

        let insert = |conn: &Connection| {
            conn.execute(
                "INSERT OR IGNORE INTO chunks
                    (id, tenant_id, project_id, source, source_ids, content, content_hash,
                     label, tags, created_at, token_count, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    chunk.id.to_string(),
                    self.scope.tenant_id,
                    self.scope.project_id,
                    chunk.source.as_str(),
                    source_ids,
                    chunk.content,
                    hash,
                    chunk.label.as_str(),
                    tags,
                    ts(&chunk.created_at),
                    chunk.token_count,
                    embedding,
                ],
            )
        };

        self.with_conn(|conn| {
            let inserted = match insert(conn) {
                Ok(n) => n,
                Err(err) if is_fts_corruption(&err) => {
                    warn!(error = %err, "Chunk FTS index unreadable, rebuilding");
                    rebuild_fts(conn)?;
                    insert(conn)?
                }
                Err(err) => return Err(err.into()),
            };
            if inserted == 0 {
                debug!(label = %chunk.label, "Skipped duplicate chunk");
            }
            Ok(inserted > 0)
        })
    }

    async fn has_chunk(&self, content: &str, label: SemanticLabel) -> Result<bool> {
        let hash = content_hash(content);
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM chunks
                     WHERE tenant_id = ?1 AND project_id = ?2 AND label = ?3 AND content_hash = ?4
                     LIMIT 1",
                    params![self.scope.tenant_id, self.scope.project_id, label.as_str(), hash],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    async fn count_chunks(&self) -> Result<i64> {
        self.count("chunks")
    }

    async fn search_chunks_fts(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>> {
        let Some(expression) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks_fts
                 JOIN chunks c ON c.seq = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1 AND c.tenant_id = ?2 AND c.project_id = ?3
                 ORDER BY bm25(chunks_fts) ASC, c.id ASC
                 LIMIT ?4"
            ))?;
            let chunks = stmt
                .query_map(
                    params![expression, self.scope.tenant_id, self.scope.project_id, top_k as i64],
                    Self::map_chunk,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(chunks)
        })
    }

    async fn list_chunks_with_embeddings(&self) -> Result<Vec<Chunk>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks c
                 WHERE c.tenant_id = ?1 AND c.project_id = ?2 AND c.embedding IS NOT NULL
                 ORDER BY c.created_at ASC, c.id ASC"
            ))?;
            let chunks = stmt
                .query_map(params![self.scope.tenant_id, self.scope.project_id], Self::map_chunk)?
                .filter(|chunk| !matches!(chunk, Ok(c) if c.embedding.is_none()))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(chunks)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ingestion guards
    // ─────────────────────────────────────────────────────────────────────────

    async fn is_session_processed(&self, source_session_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM processed_sessions
                     WHERE tenant_id = ?1 AND project_id = ?2 AND source_session_id = ?3",
                    params![self.scope.tenant_id, self.scope.project_id, source_session_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    async fn mark_session_processed(&self, source_session_id: &str) -> Result<()> {
        self.check_write()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO processed_sessions
                    (tenant_id, project_id, source_session_id, processed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    self.scope.tenant_id,
                    self.scope.project_id,
                    source_session_id,
                    ts(&Utc::now())
                ],
            )?;
            Ok(())
        })
    }

    async fn clear_processed_sessions(&self, filter: &ClearFilter) -> Result<usize> {
        self.clear_scoped("processed_sessions", filter)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checkpoints
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_session_checkpoint(
        &self,
        source_session_id: &str,
    ) -> Result<Option<SessionCheckpoint>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {CHECKPOINT_COLUMNS} FROM session_checkpoints
                         WHERE tenant_id = ?1 AND project_id = ?2 AND source_session_id = ?3"
                    ),
                    params![self.scope.tenant_id, self.scope.project_id, source_session_id],
                    Self::map_checkpoint,
                )
                .optional()?)
        })
    }

    async fn save_session_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        self.check_write()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_checkpoints
                    (id, tenant_id, project_id, source_session_id, last_message_timestamp,
                     last_message_index, content_hash, checkpoint_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(tenant_id, project_id, source_session_id) DO UPDATE SET
                    last_message_timestamp = excluded.last_message_timestamp,
                    last_message_index = excluded.last_message_index,
                    content_hash = excluded.content_hash,
                    updated_at = excluded.updated_at",
                params![
                    checkpoint.id.to_string(),
                    self.scope.tenant_id,
                    self.scope.project_id,
                    checkpoint.source_session_id,
                    checkpoint.last_message_timestamp.as_ref().map(ts),
                    checkpoint.last_message_index,
                    checkpoint.content_hash,
                    ts(&checkpoint.checkpoint_at),
                    ts(&Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    async fn clear_session_checkpoints(&self, filter: &ClearFilter) -> Result<usize> {
        self.clear_scoped("session_checkpoints", filter)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stats
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            processed_sessions: self.count("processed_sessions")?,
            log_entries: self.count("log_entries")?,
            chunks: self.count("chunks")?,
            checkpoints: self.count("session_checkpoints")?,
        })
    }

    async fn get_last_processed_at(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT MAX(processed_at) FROM processed_sessions
                 WHERE tenant_id = ?1 AND project_id = ?2",
                params![self.scope.tenant_id, self.scope.project_id],
                |row| row.get(0),
            )?)
        })?;
        Ok(raw.and_then(|value| parse_ts(&value).ok()))
    }

    async fn list_recent_source_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<RecentSourceSession>> {
        self.with_conn(|conn| {
            let mut sessions_stmt = conn.prepare(
                "SELECT source_session_id, MAX(timestamp) AS last_timestamp, COUNT(*) AS entry_count
                 FROM log_entries
                 WHERE tenant_id = ?1 AND project_id = ?2
                   AND source_session_id IS NOT NULL AND TRIM(source_session_id) != ''
                 GROUP BY source_session_id
                 ORDER BY last_timestamp DESC
                 LIMIT ?3",
            )?;
            let rows = sessions_stmt
                .query_map(
                    params![self.scope.tenant_id, self.scope.project_id, limit as i64],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            parse_ts(&row.get::<_, String>(1)?)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut highlights_stmt = conn.prepare(
                "SELECT label, content FROM log_entries
                 WHERE tenant_id = ?1 AND project_id = ?2 AND source_session_id = ?3
                 ORDER BY timestamp DESC
                 LIMIT 5",
            )?;

            let mut results = Vec::with_capacity(rows.len());
            for (source_session_id, last_timestamp, entry_count) in rows {
                let highlights = highlights_stmt
                    .query_map(
                        params![self.scope.tenant_id, self.scope.project_id, source_session_id],
                        |row| {
                            Ok(SessionHighlight {
                                label: row.get(0)?,
                                content: row.get(1)?,
                            })
                        },
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                results.push(RecentSourceSession {
                    source_session_id,
                    last_timestamp,
                    entry_count,
                    highlights,
                });
            }
            Ok(results)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background sync status
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_background_sync_status(&self) -> Result<BackgroundSyncStatus> {
        let status = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SYNC_STATUS_COLUMNS} FROM background_sync_status
                         WHERE tenant_id = ?1 AND project_id = ?2
                         ORDER BY updated_at DESC LIMIT 1"
                    ),
                    params![self.scope.tenant_id, self.scope.project_id],
                    Self::map_sync_status,
                )
                .optional()?)
        })?;
        Ok(status.unwrap_or_default())
    }

    async fn save_background_sync_status(&self, status: &BackgroundSyncStatus) -> Result<()> {
        self.check_write()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO background_sync_status
                    (id, tenant_id, project_id, is_running, started_at, completed_at,
                     sessions_processed, learnings_extracted, error_message, pid, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    is_running = excluded.is_running,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    sessions_processed = excluded.sessions_processed,
                    learnings_extracted = excluded.learnings_extracted,
                    error_message = excluded.error_message,
                    pid = excluded.pid,
                    updated_at = excluded.updated_at",
                params![
                    status.id.to_string(),
                    self.scope.tenant_id,
                    self.scope.project_id,
                    status.is_running,
                    status.started_at.as_ref().map(ts),
                    status.completed_at.as_ref().map(ts),
                    status.sessions_processed,
                    status.learnings_extracted,
                    status.error_message,
                    status.pid,
                    ts(&Utc::now()),
                ],
            )?;
            Ok(())
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Build an FTS5 MATCH expression: every token as a quoted prefix term, OR-joined.
///
/// Returns None when the query has no searchable tokens.
pub(crate) fn fts_match_expression(query: &str) -> Option<String> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{t}\"*"))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn rebuild_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(DROP_FTS)?;
    conn.execute_batch(FTS_SCHEMA)?;
    conn.execute("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')", [])?;
    Ok(())
}

fn is_fts_corruption(err: &rusqlite::Error) -> bool {
    let lowered = err.to_string().to_lowercase();
    ["vtable constructor failed: chunks_fts", "invalid fts5 file format", "malformed"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conversion_error)
}

fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(conversion_error)
}

fn parse_enum<T: std::str::FromStr<Err = Error>>(raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(conversion_error)
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(conversion_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::embed_text;
    use crate::models::{ChunkSource, LogSource};
    use tempfile::TempDir;

    fn store() -> LocalStore {
        LocalStore::open_in_memory(Scope::default()).unwrap()
    }

    fn chunk_with_id(id: u128, content: &str, label: SemanticLabel) -> Chunk {
        let mut chunk = Chunk::new(ChunkSource::Manual, content, label);
        chunk.id = Uuid::from_u128(id);
        chunk
    }

    #[test]
    fn test_match_expression() {
        assert_eq!(
            fts_match_expression("Redis pool-size").as_deref(),
            Some("\"redis\"* OR \"pool\"* OR \"size\"*")
        );
        assert_eq!(fts_match_expression("  ?!  "), None);
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let store = store();
        let session = Session::new("fix flaky test");
        store.create_session(&session).await.unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.task, "fix flaky test");
        assert_eq!(loaded.status, SessionStatus::Active);

        let active = store.get_active_session().await.unwrap().unwrap();
        assert_eq!(active.id, session.id);

        let mut ended = loaded.clone();
        ended.status = SessionStatus::Completed;
        ended.ended_at = Some(Utc::now());
        ended.summary = Some("done".into());
        store.update_session(&ended).await.unwrap();

        assert!(store.get_active_session().await.unwrap().is_none());
        let completed = store
            .list_sessions(10, Some(SessionStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].summary.as_deref(), Some("done"));
        assert!(store.list_sessions(10, Some(SessionStatus::Abandoned)).await.unwrap().is_empty());
        assert_eq!(store.list_sessions(10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_entry_increments_session_count() {
        let store = store();
        let session = Session::new("task");
        store.create_session(&session).await.unwrap();

        let entry = LogEntry::new(LogSource::Explicit, "Use WAL mode", SemanticLabel::Pattern)
            .with_session(session.id)
            .with_tags(vec!["sqlite".into()]);
        store.append_entry(&entry).await.unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.entry_count, 1);

        let entries = store.get_entries(session.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tags, vec!["sqlite".to_string()]);
        assert_eq!(store.count_log_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_entry_rejects_invalid() {
        let store = store();
        let entry = LogEntry::new(LogSource::Explicit, "", SemanticLabel::Gotcha);
        assert!(store.append_entry(&entry).await.unwrap_err().is_validation());
        assert_eq!(store.count_log_entries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entries_by_label() {
        let store = store();
        for (content, label) in [
            ("a", SemanticLabel::Gotcha),
            ("b", SemanticLabel::Pattern),
            ("c", SemanticLabel::HardFailure),
        ] {
            store
                .append_entry(&LogEntry::new(LogSource::Explicit, content, label))
                .await
                .unwrap();
        }

        let guardrails = store
            .get_entries_by_label(&SemanticLabel::GUARDRAIL, 100)
            .await
            .unwrap();
        assert_eq!(guardrails.len(), 2);
        assert!(store.get_entries_by_label(&[], 100).await.unwrap().is_empty());
        assert_eq!(
            store.get_entries_by_label(&SemanticLabel::GUARDRAIL, 1).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_chunk_dedup() {
        let store = store();
        let chunk = Chunk::new(ChunkSource::Manual, "Use  WAL mode", SemanticLabel::Pattern);
        assert!(store.store_chunk(&chunk).await.unwrap());

        let duplicate = Chunk::new(ChunkSource::Compaction, "Use WAL mode ", SemanticLabel::Pattern);
        assert!(!store.store_chunk(&duplicate).await.unwrap());
        assert_eq!(store.count_chunks().await.unwrap(), 1);

        let other_label = Chunk::new(ChunkSource::Manual, "Use WAL mode", SemanticLabel::Gotcha);
        assert!(store.store_chunk(&other_label).await.unwrap());
        assert_eq!(store.count_chunks().await.unwrap(), 2);

        assert!(store.has_chunk("Use WAL mode", SemanticLabel::Pattern).await.unwrap());
        assert!(!store.has_chunk("Use WAL mode", SemanticLabel::Preference).await.unwrap());
    }

    #[tokio::test]
    async fn test_fts_search_prefix_and_stemming() {
        let store = store();
        store
            .store_chunk(&Chunk::new(
                ChunkSource::Manual,
                "Connection pooling requires explicit limits",
                SemanticLabel::Gotcha,
            ))
            .await
            .unwrap();
        store
            .store_chunk(&Chunk::new(
                ChunkSource::Manual,
                "Prefer small functions",
                SemanticLabel::Preference,
            ))
            .await
            .unwrap();

        let prefix = store.search_chunks_fts("connect", 5).await.unwrap();
        assert_eq!(prefix.len(), 1);

        let stemmed = store.search_chunks_fts("pooled limit", 5).await.unwrap();
        assert_eq!(stemmed.len(), 1);
        assert!(stemmed[0].content.starts_with("Connection"));

        assert!(store.search_chunks_fts("", 5).await.unwrap().is_empty());
        assert!(store.search_chunks_fts("nonexistentterm", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fts_searches_tags() {
        let store = store();
        let mut chunk = Chunk::new(ChunkSource::Manual, "Retry with jitter", SemanticLabel::Pattern);
        chunk.tags = vec!["networking".into()];
        store.store_chunk(&chunk).await.unwrap();

        let hits = store.search_chunks_fts("networking", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, chunk.id);
    }

    #[tokio::test]
    async fn test_fts_ties_break_by_id() {
        let store = store();
        store
            .store_chunk(&chunk_with_id(2, "cache invalidation", SemanticLabel::Pattern))
            .await
            .unwrap();
        store
            .store_chunk(&chunk_with_id(1, "cache invalidation", SemanticLabel::Gotcha))
            .await
            .unwrap();

        for _ in 0..3 {
            let hits = store.search_chunks_fts("cache", 5).await.unwrap();
            let ids: Vec<_> = hits.iter().map(|c| c.id).collect();
            assert_eq!(ids, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
        }
    }

    #[tokio::test]
    async fn test_list_chunks_with_embeddings() {
        let store = store();
        store
            .store_chunk(
                &Chunk::new(ChunkSource::Manual, "with vector", SemanticLabel::Pattern)
                    .with_embedding(embed_text("with vector", 8)),
            )
            .await
            .unwrap();
        store
            .store_chunk(&Chunk::new(ChunkSource::Manual, "without", SemanticLabel::Pattern))
            .await
            .unwrap();

        let embedded = store.list_chunks_with_embeddings().await.unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].embedding.as_ref().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_rebuild_fts_keeps_search_working() {
        let store = store();
        store
            .store_chunk(&Chunk::new(ChunkSource::Manual, "durable writes", SemanticLabel::Pattern))
            .await
            .unwrap();
        store.rebuild_chunks_fts().unwrap();
        assert_eq!(store.search_chunks_fts("durable", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processed_sessions_and_clear_by_source() {
        let store = store();
        store.mark_session_processed("claude-code-abc").await.unwrap();
        store.mark_session_processed("claude-code-def").await.unwrap();
        store.mark_session_processed("cursor-123").await.unwrap();
        store.mark_session_processed("cursor-123").await.unwrap();

        assert!(store.is_session_processed("cursor-123").await.unwrap());
        assert!(store.get_last_processed_at().await.unwrap().is_some());

        let removed = store
            .clear_processed_sessions(&ClearFilter::source("Claude_Code"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!store.is_session_processed("claude-code-abc").await.unwrap());

        let removed = store
            .clear_processed_sessions(&ClearFilter::session("cursor-123"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.clear_processed_sessions(&ClearFilter::all()).await.unwrap(), 0);
        assert!(store.get_last_processed_at().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_upsert_and_clear() {
        let store = store();
        let mut checkpoint = SessionCheckpoint::new("codex-1");
        checkpoint.last_message_index = Some(4);
        checkpoint.content_hash = Some("abc".into());
        store.save_session_checkpoint(&checkpoint).await.unwrap();

        let mut updated = SessionCheckpoint::new("codex-1");
        updated.last_message_index = Some(9);
        store.save_session_checkpoint(&updated).await.unwrap();

        let loaded = store.get_session_checkpoint("codex-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, checkpoint.id);
        assert_eq!(loaded.last_message_index, Some(9));
        assert_eq!(loaded.content_hash, None);

        assert_eq!(store.get_stats().await.unwrap().checkpoints, 1);
        assert_eq!(
            store.clear_session_checkpoints(&ClearFilter::source("codex")).await.unwrap(),
            1
        );
        assert!(store.get_session_checkpoint("codex-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_background_sync_status_lifecycle() {
        let store = store();
        let initial = store.get_background_sync_status().await.unwrap();
        assert!(!initial.is_running);

        let started = store.start_background_sync(4242).await.unwrap();
        assert!(started.is_running);
        assert_eq!(started.pid, Some(4242));

        let loaded = store.get_background_sync_status().await.unwrap();
        assert!(loaded.is_running);
        assert_eq!(loaded.id, started.id);

        let done = store
            .complete_background_sync(3, 7, Some("partial".into()))
            .await
            .unwrap();
        assert!(!done.is_running);
        assert_eq!(done.pid, None);

        let loaded = store.get_background_sync_status().await.unwrap();
        assert_eq!(loaded.sessions_processed, 3);
        assert_eq!(loaded.learnings_extracted, 7);
        assert_eq!(loaded.error_message.as_deref(), Some("partial"));
    }

    #[tokio::test]
    async fn test_recent_source_sessions() {
        let store = store();
        for i in 0..7 {
            let entry = LogEntry::new(LogSource::Ingested, format!("note {i}"), SemanticLabel::Narrative)
                .with_source_session("codex-a");
            store.append_entry(&entry).await.unwrap();
        }
        store
            .append_entry(
                &LogEntry::new(LogSource::Ingested, "other", SemanticLabel::Gotcha)
                    .with_source_session("codex-b"),
            )
            .await
            .unwrap();

        let recent = store.list_recent_source_sessions(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        let a = recent.iter().find(|r| r.source_session_id == "codex-a").unwrap();
        assert_eq!(a.entry_count, 7);
        assert_eq!(a.highlights.len(), 5);
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let a = LocalStore::open(&path, Scope::new("tenant-a", "project-1")).unwrap();
        let b = LocalStore::open(&path, Scope::new("tenant-b", "project-1")).unwrap();
        let c = LocalStore::open(&path, Scope::new("tenant-a", "project-2")).unwrap();

        let session = Session::new("isolated");
        a.create_session(&session).await.unwrap();
        a.store_chunk(&Chunk::new(ChunkSource::Manual, "secret sauce", SemanticLabel::Pattern))
            .await
            .unwrap();
        a.mark_session_processed("codex-1").await.unwrap();
        a.start_background_sync(1).await.unwrap();

        for other in [&b, &c] {
            assert!(other.get_session(session.id).await.unwrap().is_none());
            assert!(other.search_chunks_fts("secret", 5).await.unwrap().is_empty());
            assert_eq!(other.count_chunks().await.unwrap(), 0);
            assert!(!other.is_session_processed("codex-1").await.unwrap());
            assert!(!other.get_background_sync_status().await.unwrap().is_running);
        }

        // Same content may be stored once per scope
        assert!(b
            .store_chunk(&Chunk::new(ChunkSource::Manual, "secret sauce", SemanticLabel::Pattern))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_strict_namespace_rejects_default_scope() {
        let store = LocalStore::open_in_memory(Scope::new("default", "my-project"))
            .unwrap()
            .with_strict_namespace(true);
        let err = store.create_session(&Session::new("task")).await.unwrap_err();
        assert!(err.to_string().contains("tenant_id"));

        let ok = LocalStore::open_in_memory(Scope::new("org-123", "repo-abc"))
            .unwrap()
            .with_strict_namespace(true);
        ok.create_session(&Session::new("task")).await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let store = LocalStore::open(&path, Scope::default()).unwrap();
            store
                .store_chunk(&Chunk::new(ChunkSource::Manual, "persist me", SemanticLabel::Pattern))
                .await
                .unwrap();
        }
        let store = LocalStore::open(&path, Scope::default()).unwrap();
        assert_eq!(store.count_chunks().await.unwrap(), 1);
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
